//! End-to-end runs of the `scan-daq` binary against an instant mock world.
//!
//! Run with: cargo test -p daq-bin --test cli

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const WORLD: &str = r#"
mode = "instant"

[[channels]]
name = "m1"
kind = "motor"
control_range = [-10.0, 10.0]

[[channels]]
name = "counts"
kind = "detector"
follows = "m1"
peak = { center = 2.0, width = 0.5, amplitude = 100.0 }

[[channels]]
name = "trig"
kind = "trigger"
detectors = ["counts"]
"#;

const SCANS: &str = r#"
[[scans]]
name = "line"
points = 5

[[scans.positioners]]
drive = "m1"
start = 0.0
end = 4.0

[[scans.detectors]]
channel = "counts"

[[scans.triggers]]
channel = "trig"
"#;

const OUT_OF_RANGE: &str = r#"
[[scans]]
name = "wide"
points = 3

[[scans.positioners]]
drive = "m1"
start = 0.0
end = 20.0
"#;

fn setup(scans: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("world.toml"), WORLD).unwrap();
    std::fs::write(dir.path().join("scans.toml"), scans).unwrap();
    dir
}

fn scan_daq(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_scan-daq"))
        .args(args)
        .arg(dir.join("scans.toml"))
        .arg("--world")
        .arg(dir.join("world.toml"))
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to launch scan-daq")
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_scan-daq"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("run"));
    assert!(text.contains("check-limits"));
    assert!(text.contains("preview"));
}

#[test]
fn test_run_prints_json_report() {
    let dir = setup(SCANS);
    let output = scan_daq(dir.path(), &["run", "--json", "--passes", "2", "--timeout-secs", "30"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let reports: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report["scan"], "line");
        assert_eq!(report["pass"], i as u64 + 1);
        assert_eq!(report["points"], 5);
        assert_eq!(report["aborted"], false);
        assert!(report["message"].as_str().unwrap().starts_with("SCAN Complete"));
        assert_eq!(
            report["positioners"][0],
            serde_json::json!([0.0, 1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(report["detectors"][0].as_array().unwrap().len(), 5);
    }
    assert!(reports[1]["generation"].as_u64() > reports[0]["generation"].as_u64());
}

#[test]
fn test_run_prints_table() {
    let dir = setup(SCANS);
    let output = scan_daq(dir.path(), &["run"]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.starts_with("scan 'line' pass 1 complete: 5 point(s)"));
    assert!(text.contains("D01"));
    // header, column labels, five rows
    assert_eq!(text.lines().count(), 7);
}

#[test]
fn test_unknown_scan_fails() {
    let dir = setup(SCANS);
    let output = scan_daq(dir.path(), &["run", "--scan", "ghost"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no scan named 'ghost'"));
}

#[test]
fn test_check_limits_passes_in_range() {
    let dir = setup(SCANS);
    let output = scan_daq(dir.path(), &["check-limits"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("line: SCAN Values within limits"));
}

#[test]
fn test_check_limits_reports_violation() {
    let dir = setup(OUT_OF_RANGE);
    let output = scan_daq(dir.path(), &["check-limits"]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("wide: P1 Value"), "stdout: {}", stdout);
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 scan(s) outside limits"));
}

#[test]
fn test_preview_json() {
    let dir = setup(SCANS);
    let output = scan_daq(dir.path(), &["preview", "--json"]);
    assert!(output.status.success());
    let preview: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        preview["positions"][0],
        serde_json::json!([0.0, 1.0, 2.0, 3.0, 4.0])
    );
}

#[test]
fn test_missing_world_file_fails() {
    let dir = setup(SCANS);
    std::fs::remove_file(dir.path().join("world.toml")).unwrap();
    let output = scan_daq(dir.path(), &["preview"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("world.toml"));
}
