#![no_main]
use libfuzzer_sys::fuzz_target;

// The CLI feeds user-edited TOML straight into this schema. Arbitrary text
// must come back as Ok or Err, never a panic, and any config that parses
// must survive validate() the same way.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = toml::from_str::<flatscan_config::Config>(data) {
        let _ = cfg.validate();
    }
});
