//! Nested scans driven through the arena.
//!
//! Run with: cargo test -p daq-scan --test nested

mod common;

use common::*;
use daq_core::error::ScanError;
use daq_driver_mock::MockWorld;
use daq_scan::{ScanArena, ScanControl, ScanSetConfig};
use std::time::Duration;

const NESTED: &str = r#"
    [[scans]]
    name = "outer"
    points = 2

    [[scans.positioners]]
    drive = "m2"
    start = 0.0
    end = 1.0

    [[scans.triggers]]
    inner_scan = "inner"

    [[scans]]
    name = "inner"
    points = 3

    [[scans.positioners]]
    drive = "m1"
    start = 0.0
    end = 2.0
"#;

fn nested(world: &MockWorld) -> ScanArena {
    let config = ScanSetConfig::from_toml_str(NESTED).unwrap();
    ScanArena::build(&config, world).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_arena_links_inner_and_outer() {
    let world = MockWorld::new();
    motor(&world, "m1");
    motor(&world, "m2");
    let arena = nested(&world);

    assert_eq!(arena.len(), 2);
    let outer = arena.id("outer").unwrap();
    let inner = arena.id("inner").unwrap();
    assert!(inner < outer, "inner scans are built first");
    assert!(arena.is_outermost(outer));
    assert!(!arena.is_outermost(inner));
    assert_eq!(arena.inner_of(outer), Some(inner));
    assert_eq!(arena.parent_of(inner), Some(outer));
    assert_eq!(arena.outermost(), vec![outer]);
    assert_eq!(arena.scan("inner").unwrap().name(), "inner");
    assert!(arena.scan("missing").is_none());

    let names: Vec<_> = arena.iter().map(|(_, s)| s.name().to_string()).collect();
    assert_eq!(names, vec!["inner", "outer"]);
}

#[tokio::test(start_paused = true)]
async fn test_outer_point_runs_inner_pass() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    let m2 = motor(&world, "m2");
    let arena = nested(&world);

    let outer = arena.scan("outer").unwrap();
    let outcome = run_pass(outer).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.points, 2);
    assert_eq!(m2.writes(), vec![0.0, 1.0]);
    assert_eq!(m1.writes(), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);

    let inner = arena.scan("inner").unwrap();
    assert_eq!(inner.status().point, 3);
    assert_eq!(inner.buffers().snapshot().generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_all_stops_every_level() {
    let world = MockWorld::new();
    slow_motor(&world, "m1", Duration::from_millis(100));
    motor(&world, "m2");
    let arena = nested(&world);

    let outer = arena.scan("outer").unwrap();
    let inner = arena.scan("inner").unwrap();
    let mut outer_done = outer.subscribe_outcomes();
    let mut inner_done = inner.subscribe_outcomes();

    outer.request_start().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(inner.status().busy);
    arena.abort_all();

    let inner_outcome = next_outcome(&mut inner_done).await;
    assert!(inner_outcome.aborted);
    let outer_outcome = next_outcome(&mut outer_done).await;
    assert!(outer_outcome.aborted);
    assert!(!outer.status().busy);
    assert!(!inner.status().busy);
}

#[tokio::test(start_paused = true)]
async fn test_busy_inner_scan_degrades_outer_pass() {
    let world = MockWorld::new();
    slow_motor(&world, "m1", Duration::from_millis(100));
    motor(&world, "m2");
    let arena = nested(&world);

    let inner = arena.scan("inner").unwrap();
    inner.request_start().unwrap();

    let outer = arena.scan("outer").unwrap();
    let outcome = run_pass(outer).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.points, 2);
    let status = outer.status();
    assert!(status.degraded);
    assert!(status.alert);
}

#[tokio::test(start_paused = true)]
async fn test_kill_all_leaves_every_scan_idle() {
    let world = MockWorld::new();
    slow_motor(&world, "m1", Duration::from_millis(100));
    motor(&world, "m2");
    let arena = nested(&world);

    let outer = arena.scan("outer").unwrap();
    outer.request_start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    arena.kill_all();

    for (_, scan) in arena.iter() {
        let status = scan.status();
        assert!(!status.busy, "{} still busy", scan.name());
        assert!(!status.executing);
    }
}

#[test]
fn test_nesting_cycle_rejected() {
    let config = r#"
        [[scans]]
        name = "a"
        [[scans.triggers]]
        inner_scan = "b"

        [[scans]]
        name = "b"
        [[scans.triggers]]
        inner_scan = "a"
    "#;
    let err = ScanSetConfig::from_toml_str(config).unwrap_err();
    assert!(matches!(err, ScanError::Configuration(_)));
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn test_unknown_inner_scan_rejected() {
    let config = r#"
        [[scans]]
        name = "a"
        [[scans.triggers]]
        inner_scan = "ghost"
    "#;
    let err = ScanSetConfig::from_toml_str(config).unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_status_serializes() {
    let world = MockWorld::new();
    motor(&world, "m1");
    motor(&world, "m2");
    let arena = nested(&world);

    let status = arena.scan("outer").unwrap().status();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["scan"], "outer");
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["points"], 2);
}
