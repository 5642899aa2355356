use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use flatscan_core::motor::{build_step_table, scan_speed_for, MotorTuning};
use flatscan_core::GammaTable;

pub fn bench_profile_tables(c: &mut Criterion) {
    let mut g = c.benchmark_group("profile_tables");
    // Allow quick tweaking without CLI flags (Criterion 0.5):
    //   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p flatscan_core --bench profile_tables
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(1));
        }
    } else {
        g.sample_size(50);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(std::time::Duration::from_millis(ms_u64));
    }

    // Speed-table assembly runs once per arming; the easing curve is the
    // expensive part.
    for &dpi in &[75u16, 300, 1200] {
        g.bench_function(format!("step_table_{dpi}dpi"), |b| {
            b.iter_batched(
                MotorTuning::default,
                |tuning| {
                    let table = build_step_table(black_box(&tuning), scan_speed_for(dpi));
                    black_box(table.to_bytes().len());
                },
                BatchSize::SmallInput,
            )
        });
    }

    // Full 16-bit LUT build, the slowest part of stream setup.
    for &gamma in &[1.8f32, 2.2] {
        g.bench_function(format!("gamma_lut_{gamma}"), |b| {
            b.iter(|| {
                let t = GammaTable::from_exponent(black_box(gamma)).unwrap();
                black_box(t.apply(0x8000));
            })
        });
    }
    g.finish();
}

criterion_group!(profile_tables, bench_profile_tables);
criterion_main!(profile_tables);
