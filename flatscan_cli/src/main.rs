mod cli;
mod error_fmt;
mod scan;

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use eyre::WrapErr;
use flatscan_traits::proto::{STATUS_HOME, STATUS_READY};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = run(&cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            println!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn run(cli: &Cli) -> eyre::Result<()> {
    color_eyre::install()?;
    let cfg = scan::load_config(&cli.config)?;
    init_logging(cli, &cfg.logging)?;

    match &cli.cmd {
        Commands::Scan {
            out,
            dpi,
            origin_x,
            origin_y,
            width,
            height,
            color,
            depth,
            gamma,
            gamma_csv,
            no_calibrate,
        } => {
            let summary = scan::run_scan(
                &cfg,
                out,
                *dpi,
                *origin_x,
                *origin_y,
                *width,
                *height,
                *color,
                *depth,
                *gamma,
                gamma_csv.as_deref(),
                *no_calibrate,
            )?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "out": summary.out,
                        "lines": summary.lines,
                        "bytes": summary.bytes,
                    })
                );
            } else {
                println!(
                    "scanned {} lines ({} bytes) to {}",
                    summary.lines,
                    summary.bytes,
                    summary.out.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Calibrate { dpi } => {
            let afe = scan::run_calibrate(&cfg, *dpi)?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "offsets": afe.offset_mag,
                        "negative": afe.offset_negative,
                        "gains": afe.gain,
                    })
                );
            } else {
                println!("calibration complete; persist it with:");
                println!();
                println!("[calibration.afe]");
                println!(
                    "offsets = [{}, {}, {}]",
                    afe.offset_mag[0], afe.offset_mag[1], afe.offset_mag[2]
                );
                println!(
                    "negative = [{}, {}, {}]",
                    afe.offset_negative[0], afe.offset_negative[1], afe.offset_negative[2]
                );
                println!("gains = [{}, {}, {}]", afe.gain[0], afe.gain[1], afe.gain[2]);
            }
        }
        Commands::SelfCheck => {
            let status = scan::run_self_check(&cfg)?;
            let ready = status & STATUS_READY != 0;
            let home = status & STATUS_HOME != 0;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": true,
                        "status": status,
                        "ready": ready,
                        "home": home,
                    })
                );
            } else {
                println!("self-check ok (status 0x{status:02x}; ready={ready}, home={home})");
            }
        }
        Commands::Park => {
            scan::run_park(&cfg)?;
            if cli.json {
                println!("{}", serde_json::json!({ "ok": true }));
            } else {
                println!("carriage parked");
            }
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli, logging: &flatscan_config::Logging) -> eyre::Result<()> {
    let level = cli
        .log_level
        .as_deref()
        .or(logging.level.as_deref())
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if cli.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    });

    if let Some(path) = &logging.file {
        let p = std::path::Path::new(path);
        let dir = p
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let name = p
            .file_name()
            .map_or_else(|| std::ffi::OsString::from("flatscan.log"), ToOwned::to_owned);
        let appender = match logging.rotation.as_deref().unwrap_or("never") {
            "daily" => tracing_appender::rolling::daily(dir, name),
            "hourly" => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .wrap_err("initializing logging")?;
    Ok(())
}
