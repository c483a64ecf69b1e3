//! End-to-end passes against the mock driver.
//!
//! Run with: cargo test -p daq-scan --test scan_scenarios

mod common;

use common::*;
use daq_core::error::ScanError;
use daq_driver_mock::{ChannelKind, MockChannel, MockWorld};
use daq_scan::{
    AcquisitionMode, ChannelStatus, Phase, PositionerConfig, RetracePolicy, Scan, ScanConfig,
    ScanControl, StepMode,
};
use std::time::Duration;

fn config(points: usize, positioners: Vec<PositionerConfig>) -> ScanConfig {
    ScanConfig {
        name: "s1".into(),
        points,
        positioners,
        ..Default::default()
    }
}

// =============================================================================
// Linear passes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_linear_pass_records_every_point() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    let rbv = world.insert(MockChannel::builder("m1.rbv", ChannelKind::Readback).build());
    m1.link_readback(rbv);

    let mut positioner = linear("m1", 0.0, 10.0);
    positioner.readback = Some("m1.rbv".into());
    let scan = Scan::new(config(6, vec![positioner]), &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.points, 6);
    assert_eq!(outcome.message, "SCAN Complete");
    assert_eq!(positions(&scan, 0), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    assert_eq!(m1.writes(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);

    let status = scan.status();
    assert_eq!(status.phase, Phase::Idle);
    assert_eq!(status.point, 6);
    assert!(!status.busy);
    assert!(!status.executing);
}

#[tokio::test(start_paused = true)]
async fn test_prior_retrace_returns_to_start_position() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .initial(-1.0)
            .build(),
    );
    let mut cfg = config(3, vec![linear("m1", 0.0, 2.0)]);
    cfg.retrace = RetracePolicy::Prior;
    let scan = Scan::new(cfg, &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(!outcome.aborted);
    assert_eq!(m1.writes(), vec![0.0, 1.0, 2.0, -1.0]);
    assert_eq!(m1.value(), -1.0);
}

#[tokio::test(start_paused = true)]
async fn test_relative_positioner_offsets_from_prior() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .initial(5.0)
            .build(),
    );
    let mut positioner = linear("m1", -1.0, 1.0);
    positioner.relative = true;
    let scan = Scan::new(config(3, vec![positioner]), &world).unwrap();

    run_pass(&scan).await;

    assert_eq!(m1.writes(), vec![4.0, 5.0, 6.0]);
    assert_eq!(positions(&scan, 0), vec![4.0, 5.0, 6.0]);
}

// =============================================================================
// Faults
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connection_lost_mid_scan_ends_pass() {
    let world = MockWorld::new();
    world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .disconnect_after(3)
            .build(),
    );
    let scan = Scan::new(config(6, vec![linear("m1", 0.0, 10.0)]), &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(outcome.aborted);
    assert_eq!(outcome.points, 3);
    assert_eq!(outcome.message, "Lost connection to m1");
    assert_eq!(positions(&scan, 0), vec![0.0, 2.0, 4.0, 4.0, 4.0, 4.0]);

    let status = scan.status();
    assert_eq!(status.phase, Phase::Idle);
    assert!(status.alert);
    assert_eq!(
        status.connections.unwrap().drives[0],
        ChannelStatus::NotConnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_short_table_replays_last_entry() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    let positioner = PositionerConfig {
        drive: "m1".into(),
        mode: StepMode::Table,
        table: vec![1.0, 3.0, 5.0, 7.0],
        ..Default::default()
    };
    let scan = Scan::new(config(6, vec![positioner]), &world).unwrap();
    assert!(scan.status().alert);

    let outcome = run_pass(&scan).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.points, 6);
    assert_eq!(positions(&scan, 0), vec![1.0, 3.0, 5.0, 7.0, 7.0, 7.0]);
    assert_eq!(m1.writes().len(), 6);
    assert!(scan.status().alert);
}

#[tokio::test(start_paused = true)]
async fn test_limit_violation_refuses_start() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .control_range(-5.0, 5.0)
            .build(),
    );
    let scan = Scan::new(config(6, vec![linear("m1", 0.0, 10.0)]), &world).unwrap();

    assert!(matches!(
        scan.check_limits(),
        Err(ScanError::LimitViolation { .. })
    ));

    let outcome = run_pass(&scan).await;
    assert!(outcome.aborted);
    assert_eq!(outcome.points, 0);
    assert!(m1.writes().is_empty());
    let status = scan.status();
    assert_eq!(status.phase, Phase::Idle);
    assert!(status.alert);
}

#[tokio::test(start_paused = true)]
async fn test_check_limits_within_range() {
    let world = MockWorld::new();
    world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .control_range(-20.0, 20.0)
            .build(),
    );
    let scan = Scan::new(config(6, vec![linear("m1", 0.0, 10.0)]), &world).unwrap();

    scan.check_limits().unwrap();
    assert_eq!(scan.status().message, "SCAN Values within limits");
}

#[tokio::test(start_paused = true)]
async fn test_completion_deadline_aborts_pass() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    m1.hold(true);
    let mut cfg = config(3, vec![linear("m1", 0.0, 2.0)]);
    cfg.completion_timeout = Some(Duration::from_millis(50));
    let scan = Scan::new(cfg, &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(outcome.aborted);
    assert_eq!(outcome.points, 0);
    assert!(outcome.message.contains("Timeout"), "{}", outcome.message);
    assert_eq!(scan.status().phase, Phase::Idle);
}

// =============================================================================
// Detectors
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_peak_retrace_moves_to_maximum() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    sequence_detector(&world, "t1", "d1", vec![1.0, 2.0, 5.0, 2.0, 1.0]);

    let mut cfg = config(5, vec![linear("m1", 0.0, 4.0)]);
    cfg.detectors = vec![detector("d1")];
    cfg.triggers = vec![trigger("t1")];
    cfg.retrace = RetracePolicy::Peak;
    let scan = Scan::new(cfg, &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.message, "SCAN Complete: PEAK POS found.");
    assert_eq!(detections(&scan, 0), vec![1.0, 2.0, 5.0, 2.0, 1.0]);
    assert_eq!(m1.value(), 2.0);
    assert_eq!(scan.status().mark, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_flat_data_returns_to_prior() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .initial(0.5)
            .build(),
    );
    sequence_detector(&world, "t1", "d1", vec![3.0]);

    let mut cfg = config(4, vec![linear("m1", 0.0, 3.0)]);
    cfg.detectors = vec![detector("d1")];
    cfg.triggers = vec![trigger("t1")];
    cfg.retrace = RetracePolicy::Peak;
    let scan = Scan::new(cfg, &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert_eq!(outcome.message, "SCAN Complete: PEAK POS NOT found.");
    assert_eq!(m1.value(), 0.5);
    assert!(scan.status().alert);
    assert_eq!(scan.status().mark, None);
}

#[tokio::test(start_paused = true)]
async fn test_detector_follows_positioner_profile() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    let d1 = world.insert(
        MockChannel::builder("d1", ChannelKind::Detector)
            .profile(daq_driver_mock::PeakProfile {
                center: 3.0,
                width: 0.5,
                amplitude: 100.0,
                background: 0.0,
            })
            .build(),
    );
    d1.follow(m1.clone());

    let mut cfg = config(7, vec![linear("m1", 0.0, 6.0)]);
    cfg.detectors = vec![detector("d1")];
    cfg.retrace = RetracePolicy::Peak;
    let scan = Scan::new(cfg, &world).unwrap();

    run_pass(&scan).await;

    let data = detections(&scan, 0);
    assert_eq!(data.len(), 7);
    assert_eq!(data[3], 100.0);
    assert_eq!(m1.value(), 3.0);
}

#[tokio::test(start_paused = true)]
async fn test_accumulate_adds_consecutive_passes() {
    let world = MockWorld::new();
    motor(&world, "m1");
    world.insert(
        MockChannel::builder("d1", ChannelKind::Detector)
            .initial(3.0)
            .build(),
    );
    let mut cfg = config(4, vec![linear("m1", 0.0, 3.0)]);
    cfg.detectors = vec![detector("d1")];
    cfg.acquisition = AcquisitionMode::Accumulate;
    let scan = Scan::new(cfg, &world).unwrap();

    let first = run_pass(&scan).await;
    assert_eq!(&detections(&scan, 0)[..4], &[3.0; 4]);

    let second = run_pass(&scan).await;
    assert_eq!(&detections(&scan, 0)[..4], &[6.0; 4]);
    assert!(second.generation > first.generation);

    run_pass(&scan).await;
    assert_eq!(&detections(&scan, 0)[..4], &[9.0; 4]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_detector_degrades_pass() {
    let world = MockWorld::new();
    let m1 = slow_motor(&world, "m1", Duration::from_millis(10));
    let d1 = world.insert(
        MockChannel::builder("d1", ChannelKind::Detector)
            .initial(7.0)
            .build(),
    );
    let mut cfg = config(4, vec![linear("m1", 0.0, 3.0)]);
    cfg.detectors = vec![detector("d1")];
    let scan = Scan::new(cfg, &world).unwrap();

    let mut outcomes = scan.subscribe_outcomes();
    scan.request_start().unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    d1.set_connected(false);
    let outcome = next_outcome(&mut outcomes).await;

    assert!(!outcome.aborted);
    assert_eq!(outcome.points, 4);
    assert!(scan.status().degraded);
    let data = detections(&scan, 0);
    assert_eq!(data[0], 7.0);
    assert_eq!(data[3], 0.0);
    assert_eq!(m1.writes().len(), 4);
}

// =============================================================================
// Connectivity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_pends_until_channels_connect() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .connected(false)
            .build(),
    );
    let scan = Scan::new(config(3, vec![linear("m1", 0.0, 2.0)]), &world).unwrap();

    let mut outcomes = scan.subscribe_outcomes();
    scan.request_start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = scan.status();
    assert_eq!(status.phase, Phase::ScanPending);
    assert!(status.executing);
    assert!(m1.writes().is_empty());

    m1.set_connected(true);
    let outcome = next_outcome(&mut outcomes).await;
    assert!(!outcome.aborted);
    assert_eq!(m1.writes(), vec![0.0, 1.0, 2.0]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_pending_returns_to_idle() {
    let world = MockWorld::new();
    let m1 = world.insert(
        MockChannel::builder("m1", ChannelKind::Motor)
            .connected(false)
            .build(),
    );
    let scan = Scan::new(config(3, vec![linear("m1", 0.0, 2.0)]), &world).unwrap();

    scan.request_start().unwrap();
    scan.request_abort();

    let status = scan.status();
    assert_eq!(status.phase, Phase::Idle);
    assert!(!status.executing);

    m1.set_connected(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(m1.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unnamed_slots_are_skipped() {
    let world = MockWorld::new();
    let m1 = motor(&world, "m1");
    let mut cfg = config(2, vec![linear("m1", 0.0, 1.0)]);
    cfg.detectors = vec![detector("")];
    let scan = Scan::new(cfg, &world).unwrap();

    let outcome = run_pass(&scan).await;

    assert!(!outcome.aborted);
    assert_eq!(m1.writes(), vec![0.0, 1.0]);
    assert_eq!(&detections(&scan, 0)[..2], &[0.0, 0.0]);
}
