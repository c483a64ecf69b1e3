//! Simulated scan channels.
//!
//! One [`MockChannel`] type covers every role a scan uses. Its [`ChannelKind`]
//! decides what a write does:
//!
//! - **Motor**: the value moves to the target after the move time and is
//!   mirrored into a linked readback channel
//! - **Readback**: read-only, follows its motor
//! - **Detector**: value comes from a scripted sequence (advanced by linked
//!   triggers), a fixed array, or a peak profile over a followed motor
//! - **Trigger**: completes after the trigger time and advances its detectors
//! - **Hook**: records the write and completes after the hook time
//!
//! Every write is logged so tests can assert on exactly what the scan issued.

use async_trait::async_trait;
use daq_core::channel::{ChannelHandle, ChannelMetadata, ConnectionState, PutStatus};
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::common::{ErrorConfig, MockRng};

/// What a channel simulates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Positioner drive.
    #[default]
    Motor,
    /// Positioner readback.
    Readback,
    /// Detector value.
    Detector,
    /// Detector trigger.
    Trigger,
    /// Before/after-scan hook.
    Hook,
}

/// Gaussian detector response centered on a motor position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakProfile {
    /// Motor position of the maximum.
    pub center: f64,
    /// Standard deviation.
    pub width: f64,
    /// Height above baseline.
    pub amplitude: f64,
    /// Baseline.
    #[serde(default)]
    pub background: f64,
}

impl PeakProfile {
    /// Response at `position`.
    pub fn at(&self, position: f64) -> f64 {
        let width = if self.width.abs() > f64::EPSILON {
            self.width
        } else {
            1.0
        };
        let z = (position - self.center) / width;
        self.background + self.amplitude * (-0.5 * z * z).exp()
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    value: f64,
    array: Vec<f64>,
    sequence: Vec<f64>,
    sequence_index: usize,
    writes: Vec<f64>,
    completed_moves: u32,
}

#[derive(Default)]
struct Links {
    readback: Option<Arc<MockChannel>>,
    detectors: Vec<Arc<MockChannel>>,
    follows: Option<Arc<MockChannel>>,
}

/// Simulated endpoint.
pub struct MockChannel {
    name: String,
    kind: ChannelKind,
    metadata: ChannelMetadata,
    connection: watch::Sender<ConnectionState>,
    monitor: watch::Sender<Option<f64>>,
    held: watch::Sender<bool>,
    state: Mutex<ChannelState>,
    links: Mutex<Links>,
    completion_time: Duration,
    disconnect_after: Option<u32>,
    profile: Option<PeakProfile>,
    noise: f64,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("connected", &self.connection.borrow().is_connected())
            .finish()
    }
}

impl MockChannel {
    /// Builder for a channel of `kind`.
    pub fn builder(name: impl Into<String>, kind: ChannelKind) -> MockChannelBuilder {
        MockChannelBuilder::new(name, kind)
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Current scalar value, bypassing connectivity and error injection.
    pub fn value(&self) -> f64 {
        self.state.lock().value
    }

    /// Overwrite the value and notify monitors.
    pub fn set_value(&self, value: f64) {
        self.state.lock().value = value;
        self.monitor.send_replace(Some(value));
    }

    /// Every value written, in order.
    pub fn writes(&self) -> Vec<f64> {
        self.state.lock().writes.clone()
    }

    /// Connect or disconnect.
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected(self.metadata.clone())
        } else {
            ConnectionState::Disconnected
        };
        tracing::debug!(channel = %self.name, connected, "mock connection changed");
        self.connection.send_replace(state);
    }

    /// Hold (`true`) or release (`false`) completions. Held completions
    /// resolve once released.
    pub fn hold(&self, held: bool) {
        self.held.send_replace(held);
    }

    /// Mirror moves into `readback`.
    pub fn link_readback(&self, readback: Arc<MockChannel>) {
        self.links.lock().readback = Some(readback);
    }

    /// Advance `detectors` on every trigger.
    pub fn link_detectors(&self, detectors: Vec<Arc<MockChannel>>) {
        self.links.lock().detectors = detectors;
    }

    /// Compute the detector response from `motor`'s position.
    pub fn follow(&self, motor: Arc<MockChannel>) {
        self.links.lock().follows = Some(motor);
    }

    /// Step a sequence detector to its next value.
    pub fn advance(&self) {
        let next = {
            let mut state = self.state.lock();
            if state.sequence.is_empty() {
                return;
            }
            let index = state.sequence_index.min(state.sequence.len() - 1);
            state.sequence_index += 1;
            let value = state.sequence[index];
            state.value = value;
            value
        };
        self.monitor.send_replace(Some(next));
    }

    fn check_connected(&self) -> Result<(), DriverError> {
        if self.connection.borrow().is_connected() {
            Ok(())
        } else {
            Err(DriverError::not_connected(&self.name))
        }
    }

    fn current(&self) -> f64 {
        let follows = self.links.lock().follows.clone();
        match (self.profile, follows) {
            (Some(profile), Some(motor)) => profile.at(motor.value()) + self.rng.noise(self.noise),
            _ => self.state.lock().value + self.rng.noise(self.noise),
        }
    }

    /// Apply a write's effect immediately.
    fn apply(&self, value: f64) {
        match self.kind {
            ChannelKind::Motor => {
                self.set_value(value);
                let readback = self.links.lock().readback.clone();
                if let Some(readback) = readback {
                    readback.set_value(value);
                }
            }
            ChannelKind::Trigger => {
                let detectors = self.links.lock().detectors.clone();
                for detector in detectors {
                    detector.advance();
                }
            }
            ChannelKind::Detector | ChannelKind::Hook => self.set_value(value),
            ChannelKind::Readback => {}
        }
    }

    fn record(&self, value: f64) -> Result<(), DriverError> {
        if self.kind == ChannelKind::Readback {
            return Err(DriverError::new(
                &self.name,
                DriverErrorKind::InvalidParameter,
                "readback channels are read-only",
            ));
        }
        self.state.lock().writes.push(value);
        Ok(())
    }

    async fn wait_released(&self) {
        let mut rx = self.held.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn get(&self) -> Result<f64, DriverError> {
        self.check_connected()?;
        self.errors.check_operation(&self.name, "get")?;
        Ok(self.current())
    }

    fn get_array(&self, max: usize) -> Result<Vec<f64>, DriverError> {
        self.check_connected()?;
        self.errors.check_operation(&self.name, "get")?;
        let state = self.state.lock();
        if state.array.is_empty() {
            drop(state);
            let value = self.current();
            return Ok(if max == 0 { Vec::new() } else { vec![value] });
        }
        Ok(state.array.iter().copied().take(max).collect())
    }

    fn put(&self, value: f64) -> Result<(), DriverError> {
        self.check_connected()?;
        self.errors.check_operation(&self.name, "put")?;
        self.record(value)?;
        self.apply(value);
        Ok(())
    }

    async fn put_with_completion(&self, value: f64) -> PutStatus {
        if self.check_connected().is_err() {
            return PutStatus::Disconnected;
        }
        if let Err(err) = self.record(value) {
            return PutStatus::Failed(err);
        }
        if let Some(fault) = self.errors.completion_fault(&self.name) {
            tracing::debug!(channel = %self.name, ?fault, "injected completion fault");
            return fault;
        }

        if self.kind == ChannelKind::Motor {
            let completed = self.state.lock().completed_moves;
            if self.disconnect_after.is_some_and(|limit| completed >= limit) {
                self.set_connected(false);
                return PutStatus::Disconnected;
            }
        }

        if !self.completion_time.is_zero() {
            tokio::time::sleep(self.completion_time).await;
        }
        self.wait_released().await;
        if self.check_connected().is_err() {
            return PutStatus::Disconnected;
        }

        self.apply(value);
        if self.kind == ChannelKind::Motor {
            self.state.lock().completed_moves += 1;
        }
        PutStatus::Done
    }

    fn monitor(&self) -> watch::Receiver<Option<f64>> {
        self.monitor.subscribe()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`MockChannel`] with fluent API
pub struct MockChannelBuilder {
    name: String,
    kind: ChannelKind,
    initial: f64,
    connected: Option<bool>,
    completion_time: Duration,
    control_range: Option<(f64, f64)>,
    units: String,
    sequence: Vec<f64>,
    array: Vec<f64>,
    disconnect_after: Option<u32>,
    profile: Option<PeakProfile>,
    noise: f64,
    errors: ErrorConfig,
    rng: Option<Arc<MockRng>>,
}

impl MockChannelBuilder {
    /// Create a new builder with defaults
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            initial: 0.0,
            connected: Some(true),
            completion_time: Duration::ZERO,
            control_range: None,
            units: String::new(),
            sequence: Vec::new(),
            array: Vec::new(),
            disconnect_after: None,
            profile: None,
            noise: 0.0,
            errors: ErrorConfig::none(),
            rng: None,
        }
    }

    /// Set initial value
    pub fn initial(mut self, value: f64) -> Self {
        self.initial = value;
        self
    }

    /// Start connected (`true`), disconnected (`false`)
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = Some(connected);
        self
    }

    /// Start in the connecting state, as for an unresolved name
    pub fn connecting(mut self) -> Self {
        self.connected = None;
        self
    }

    /// Time a write with completion takes
    pub fn completion_time(mut self, time: Duration) -> Self {
        self.completion_time = time;
        self
    }

    /// Range published in the connect metadata
    pub fn control_range(mut self, low: f64, high: f64) -> Self {
        self.control_range = Some((low, high));
        self
    }

    /// Engineering units
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Values a detector steps through, one per trigger; the last repeats
    pub fn sequence(mut self, values: Vec<f64>) -> Self {
        self.sequence = values;
        self
    }

    /// Fixed array value; makes the channel array-valued
    pub fn array(mut self, values: Vec<f64>) -> Self {
        self.array = values;
        self
    }

    /// Complete this many moves, then disconnect on the next one
    pub fn disconnect_after(mut self, moves: u32) -> Self {
        self.disconnect_after = Some(moves);
        self
    }

    /// Detector response over a followed motor
    pub fn profile(mut self, profile: PeakProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Uniform noise amplitude added to every read
    pub fn noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Set error configuration
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.errors = config;
        self
    }

    /// Share an RNG (for reproducible noise)
    pub fn rng(mut self, rng: Arc<MockRng>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Build the channel
    pub fn build(self) -> MockChannel {
        let metadata = ChannelMetadata {
            control_range: self.control_range,
            display_range: self.control_range,
            units: self.units,
            element_count: self.array.len().max(1),
            ..Default::default()
        };
        let state = match self.connected {
            Some(true) => ConnectionState::Connected(metadata.clone()),
            Some(false) => ConnectionState::Disconnected,
            None => ConnectionState::Connecting,
        };
        let (connection, _) = watch::channel(state);
        let (monitor, _) = watch::channel(Some(self.initial));
        let (held, _) = watch::channel(false);
        MockChannel {
            name: self.name,
            kind: self.kind,
            metadata,
            connection,
            monitor,
            held,
            state: Mutex::new(ChannelState {
                value: self.initial,
                array: self.array,
                sequence: self.sequence,
                ..Default::default()
            }),
            links: Mutex::new(Links::default()),
            completion_time: self.completion_time,
            disconnect_after: self.disconnect_after,
            profile: self.profile,
            noise: self.noise,
            errors: self.errors,
            rng: self.rng.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_motor_moves_and_mirrors_readback() {
        let motor = MockChannel::builder("m1", ChannelKind::Motor).build();
        let readback = Arc::new(MockChannel::builder("m1.rbv", ChannelKind::Readback).build());
        motor.link_readback(readback.clone());

        assert_eq!(motor.put_with_completion(2.5).await, PutStatus::Done);
        assert_eq!(motor.get().unwrap(), 2.5);
        assert_eq!(readback.get().unwrap(), 2.5);
        assert_eq!(motor.writes(), vec![2.5]);
        assert!(readback.put(1.0).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_after_moves() {
        let motor = MockChannel::builder("m1", ChannelKind::Motor)
            .disconnect_after(2)
            .build();
        assert_eq!(motor.put_with_completion(1.0).await, PutStatus::Done);
        assert_eq!(motor.put_with_completion(2.0).await, PutStatus::Done);
        assert_eq!(motor.put_with_completion(3.0).await, PutStatus::Disconnected);
        assert!(!motor.is_connected());
        assert!(motor.get().is_err());
    }

    #[tokio::test]
    async fn test_trigger_advances_sequence() {
        let detector = Arc::new(
            MockChannel::builder("d1", ChannelKind::Detector)
                .sequence(vec![1.0, 2.0, 5.0])
                .build(),
        );
        let trigger = MockChannel::builder("t1", ChannelKind::Trigger).build();
        trigger.link_detectors(vec![detector.clone()]);

        let mut seen = Vec::new();
        for _ in 0..4 {
            assert_eq!(trigger.put_with_completion(1.0).await, PutStatus::Done);
            seen.push(detector.get().unwrap());
        }
        assert_eq!(seen, vec![1.0, 2.0, 5.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_delays_completion() {
        let hook = Arc::new(MockChannel::builder("hook", ChannelKind::Hook).build());
        hook.hold(true);
        let task = {
            let hook = hook.clone();
            tokio::spawn(async move { hook.put_with_completion(1.0).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        hook.hold(false);
        assert_eq!(task.await.unwrap(), PutStatus::Done);
    }

    #[test]
    fn test_peak_profile() {
        let profile = PeakProfile {
            center: 2.0,
            width: 0.5,
            amplitude: 10.0,
            background: 1.0,
        };
        assert_eq!(profile.at(2.0), 11.0);
        assert!(profile.at(4.0) < 1.1);
    }

    #[test]
    fn test_array_metadata() {
        let detector = MockChannel::builder("mca", ChannelKind::Detector)
            .array(vec![1.0, 2.0, 3.0])
            .build();
        assert_eq!(detector.metadata().unwrap().element_count, 3);
        assert_eq!(detector.get_array(2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_connecting_state() {
        let channel = MockChannel::builder("late", ChannelKind::Motor)
            .connecting()
            .build();
        assert!(!channel.is_connected());
        channel.set_connected(true);
        assert!(channel.is_connected());
    }
}
