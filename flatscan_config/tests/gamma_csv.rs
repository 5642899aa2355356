use std::fs::File;
use std::io::Write;

use flatscan_config::{load_gamma_csv, GammaCurve, GammaRow};
use rstest::rstest;
use tempfile::tempdir;

fn write_csv(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut f = File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path
}

#[rstest]
fn two_point_curve_loads() {
    let dir = tempdir().unwrap();
    let path = write_csv(&dir, "gamma.csv", "input,output\n0,0\n65535,65535\n");
    let curve = load_gamma_csv(&path).unwrap();
    assert_eq!(curve.points, vec![(0, 0), (65535, 65535)]);
}

#[rstest]
fn wrong_headers_are_rejected() {
    let dir = tempdir().unwrap();
    let path = write_csv(&dir, "gamma.csv", "in,out\n0,0\n65535,65535\n");
    let err = load_gamma_csv(&path).unwrap_err();
    assert!(err.to_string().contains("input,output"));
}

#[rstest]
fn bad_row_reports_its_line_number() {
    let dir = tempdir().unwrap();
    let path = write_csv(&dir, "gamma.csv", "input,output\n0,0\nnot-a-number,9\n");
    let err = load_gamma_csv(&path).unwrap_err();
    assert!(err.to_string().contains("row 3"), "got: {err}");
}

#[rstest]
fn non_monotonic_inputs_are_rejected() {
    let rows = vec![
        GammaRow {
            input: 0,
            output: 0,
        },
        GammaRow {
            input: 500,
            output: 900,
        },
        GammaRow {
            input: 500,
            output: 1000,
        },
    ];
    let err = GammaCurve::from_rows(rows).unwrap_err();
    assert!(err.to_string().contains("strictly increasing"));
}

#[rstest]
fn single_row_is_rejected() {
    let rows = vec![GammaRow {
        input: 0,
        output: 0,
    }];
    let err = GammaCurve::from_rows(rows).unwrap_err();
    assert!(err.to_string().contains("at least two"));
}
