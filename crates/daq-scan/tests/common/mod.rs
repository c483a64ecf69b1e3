//! Shared fixtures for scan integration tests.

#![allow(dead_code)]

use daq_driver_mock::{ChannelKind, MockChannel, MockWorld};
use daq_scan::{DetectorConfig, PositionerConfig, Scan, ScanOutcome, TriggerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for any single pass in these tests (virtual time).
pub const PASS_TIMEOUT: Duration = Duration::from_secs(60);

pub fn motor(world: &MockWorld, name: &str) -> Arc<MockChannel> {
    world.insert(MockChannel::builder(name, ChannelKind::Motor).build())
}

pub fn slow_motor(world: &MockWorld, name: &str, move_time: Duration) -> Arc<MockChannel> {
    world.insert(
        MockChannel::builder(name, ChannelKind::Motor)
            .completion_time(move_time)
            .build(),
    )
}

/// Trigger `trigger` advancing a sequence detector `detector`.
pub fn sequence_detector(
    world: &MockWorld,
    trigger: &str,
    detector: &str,
    values: Vec<f64>,
) -> Arc<MockChannel> {
    let det = world.insert(
        MockChannel::builder(detector, ChannelKind::Detector)
            .sequence(values)
            .build(),
    );
    let trig = world.insert(MockChannel::builder(trigger, ChannelKind::Trigger).build());
    trig.link_detectors(vec![det.clone()]);
    det
}

pub fn linear(drive: &str, start: f64, end: f64) -> PositionerConfig {
    PositionerConfig {
        drive: drive.into(),
        start,
        end: Some(end),
        ..Default::default()
    }
}

pub fn detector(channel: &str) -> DetectorConfig {
    DetectorConfig {
        channel: channel.into(),
    }
}

pub fn trigger(channel: &str) -> TriggerConfig {
    TriggerConfig {
        channel: Some(channel.into()),
        ..Default::default()
    }
}

pub async fn next_outcome(outcomes: &mut broadcast::Receiver<ScanOutcome>) -> ScanOutcome {
    tokio::time::timeout(PASS_TIMEOUT, outcomes.recv())
        .await
        .expect("scan did not finish in time")
        .expect("outcome channel closed")
}

/// Start `scan` and wait for the pass to finish.
pub async fn run_pass(scan: &Scan) -> ScanOutcome {
    use daq_scan::ScanControl;

    let mut outcomes = scan.subscribe_outcomes();
    scan.request_start().expect("start refused");
    next_outcome(&mut outcomes).await
}

/// Published positioner array, cut to the scan's point count (padding
/// included).
pub fn positions(scan: &Scan, slot: usize) -> Vec<f64> {
    let npts = scan.status().points;
    scan.buffers()
        .snapshot()
        .positioner(slot)
        .map(|s| s[..npts.min(s.len())].to_vec())
        .unwrap_or_default()
}

/// Published detector array, cut like [`positions`].
pub fn detections(scan: &Scan, slot: usize) -> Vec<f64> {
    let npts = scan.status().points;
    scan.buffers()
        .snapshot()
        .detector(slot)
        .map(|s| s[..npts.min(s.len())].to_vec())
        .unwrap_or_default()
}
