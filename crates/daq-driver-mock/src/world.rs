//! Registry of mock channels, resolvable by name.
//!
//! [`MockWorld`] implements [`ChannelProvider`], so a scan built against it
//! resolves its channel names exactly as it would against real hardware.
//! Names the world does not know resolve to a placeholder that stays in the
//! connecting state until [`MockChannel::set_connected`] is called on it
//! (reach it through [`MockWorld::get`]).
//!
//! A world is usually described in TOML:
//!
//! ```toml
//! mode = "realistic"
//! seed = 7
//!
//! [[channels]]
//! name = "m1"
//! kind = "motor"
//! readback = "m1.rbv"
//! move_time = "20ms"
//! control_range = [-10.0, 10.0]
//!
//! [[channels]]
//! name = "m1.rbv"
//! kind = "readback"
//!
//! [[channels]]
//! name = "d1"
//! kind = "detector"
//! follows = "m1"
//! peak = { center = 2.0, width = 0.5, amplitude = 100.0 }
//!
//! [[channels]]
//! name = "t1"
//! kind = "trigger"
//! detectors = ["d1"]
//! ```

use anyhow::{Context, Result, anyhow};
use daq_core::channel::{ChannelHandle, ChannelProvider, SharedChannel};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelKind, MockChannel, PeakProfile};
use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};

/// Failure rate applied to every channel in chaos mode.
const CHAOS_FAILURE_RATE: f64 = 0.02;

/// One channel of a [`MockWorldConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockChannelConfig {
    /// Channel name.
    pub name: String,
    /// What the channel simulates.
    pub kind: ChannelKind,
    /// Initial value.
    pub initial: f64,
    /// Start connected.
    #[serde(default = "default_true")]
    pub connected: bool,
    /// Completion time; defaults per kind in realistic mode.
    #[serde(with = "humantime_serde")]
    pub move_time: Option<Duration>,
    /// Control range published at connect.
    pub control_range: Option<(f64, f64)>,
    /// Engineering units.
    pub units: String,
    /// Motor: readback channel mirroring its moves.
    pub readback: Option<String>,
    /// Trigger: detectors advanced on every trigger.
    pub detectors: Vec<String>,
    /// Detector: motor whose position drives `peak`.
    pub follows: Option<String>,
    /// Detector: response over `follows`.
    pub peak: Option<PeakProfile>,
    /// Detector: scripted values, one per trigger.
    pub sequence: Vec<f64>,
    /// Detector: fixed array value.
    pub array: Vec<f64>,
    /// Noise amplitude.
    pub noise: f64,
    /// Motor: disconnect after this many moves.
    pub disconnect_after: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// A complete simulated beamline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockWorldConfig {
    /// Operational mode.
    pub mode: MockMode,
    /// Seed for noise and injected failures.
    pub seed: Option<u64>,
    /// Channels.
    pub channels: Vec<MockChannelConfig>,
}

impl MockWorldConfig {
    /// Parse from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse mock world")
    }

    /// Load from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

/// Name-addressed set of mock channels.
#[derive(Debug, Default)]
pub struct MockWorld {
    channels: RwLock<HashMap<String, Arc<MockChannel>>>,
}

impl MockWorld {
    /// Empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every channel of `config` and wire up their links.
    ///
    /// # Errors
    ///
    /// Duplicate names or links to unknown channels.
    pub fn from_config(config: &MockWorldConfig) -> Result<Self> {
        let world = Self::new();
        let rng = Arc::new(MockRng::new(config.seed));

        for ch in &config.channels {
            if world.get(&ch.name).is_some() {
                return Err(anyhow!("duplicate mock channel '{}'", ch.name));
            }
            let defaults = match ch.kind {
                ChannelKind::Motor => TimingConfig::motor(),
                ChannelKind::Trigger | ChannelKind::Detector => TimingConfig::detector(),
                ChannelKind::Hook | ChannelKind::Readback => TimingConfig::default(),
            };
            let completion_time = if config.mode.is_timed() {
                ch.move_time.unwrap_or_else(|| match ch.kind {
                    ChannelKind::Motor => defaults.move_time(),
                    ChannelKind::Trigger => defaults.trigger_time(),
                    _ => defaults.hook_time(),
                })
            } else {
                Duration::ZERO
            };
            let errors = match config.mode {
                MockMode::Chaos => ErrorConfig::random_failures_seeded(CHAOS_FAILURE_RATE, config.seed),
                _ => ErrorConfig::none(),
            };

            let mut builder = MockChannel::builder(&ch.name, ch.kind)
                .initial(ch.initial)
                .connected(ch.connected)
                .completion_time(completion_time)
                .units(&ch.units)
                .sequence(ch.sequence.clone())
                .array(ch.array.clone())
                .noise(ch.noise)
                .error_config(errors)
                .rng(rng.clone());
            if let Some((low, high)) = ch.control_range {
                builder = builder.control_range(low, high);
            }
            if let Some(moves) = ch.disconnect_after {
                builder = builder.disconnect_after(moves);
            }
            if let Some(profile) = ch.peak {
                builder = builder.profile(profile);
            }
            world.insert(builder.build());
        }

        for ch in &config.channels {
            let this = world.require(&ch.name)?;
            if let Some(readback) = &ch.readback {
                this.link_readback(world.require(readback)?);
                world.require(readback)?.set_value(ch.initial);
            }
            if !ch.detectors.is_empty() {
                let detectors = ch
                    .detectors
                    .iter()
                    .map(|name| world.require(name))
                    .collect::<Result<Vec<_>>>()?;
                this.link_detectors(detectors);
            }
            if let Some(motor) = &ch.follows {
                this.follow(world.require(motor)?);
            }
        }
        tracing::debug!(channels = config.channels.len(), mode = ?config.mode, "mock world built");
        Ok(world)
    }

    /// Add (or replace) a channel.
    pub fn insert(&self, channel: MockChannel) -> Arc<MockChannel> {
        let channel = Arc::new(channel);
        self.channels
            .write()
            .insert(channel.name().to_string(), channel.clone());
        channel
    }

    /// Channel by name.
    pub fn get(&self, name: &str) -> Option<Arc<MockChannel>> {
        self.channels.read().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<MockChannel>> {
        self.get(name)
            .ok_or_else(|| anyhow!("mock channel '{}' is not defined", name))
    }

    /// Names of every channel, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ChannelProvider for MockWorld {
    fn connect(&self, name: &str) -> SharedChannel {
        if let Some(channel) = self.get(name) {
            return channel;
        }
        tracing::debug!(channel = name, "unknown mock channel; left connecting");
        self.insert(MockChannel::builder(name, ChannelKind::Motor).connecting().build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORLD: &str = r#"
        [[channels]]
        name = "m1"
        kind = "motor"
        readback = "m1.rbv"
        initial = 1.5
        control_range = [-10.0, 10.0]

        [[channels]]
        name = "m1.rbv"
        kind = "readback"

        [[channels]]
        name = "d1"
        kind = "detector"
        sequence = [1.0, 2.0]

        [[channels]]
        name = "t1"
        kind = "trigger"
        detectors = ["d1"]
    "#;

    #[test]
    fn test_from_config_links_channels() {
        let config = MockWorldConfig::from_toml_str(WORLD).unwrap();
        assert_eq!(config.mode, MockMode::Instant);
        let world = MockWorld::from_config(&config).unwrap();
        assert_eq!(world.names(), vec!["d1", "m1", "m1.rbv", "t1"]);

        let m1 = world.connect("m1");
        assert_eq!(m1.metadata().unwrap().control_range, Some((-10.0, 10.0)));
        assert_eq!(world.connect("m1.rbv").get().unwrap(), 1.5);
    }

    #[test]
    fn test_unknown_link_rejected() {
        let config = MockWorldConfig::from_toml_str(
            r#"
            [[channels]]
            name = "t1"
            kind = "trigger"
            detectors = ["missing"]
            "#,
        )
        .unwrap();
        let err = MockWorld::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unknown_name_stays_connecting() {
        let world = MockWorld::new();
        let channel = world.connect("nowhere");
        assert!(!channel.is_connected());
        assert!(world.get("nowhere").is_some());
    }

    #[tokio::test]
    async fn test_trigger_through_world() {
        let world = MockWorld::from_config(&MockWorldConfig::from_toml_str(WORLD).unwrap()).unwrap();
        let trigger = world.connect("t1");
        trigger.put_with_completion(1.0).await;
        assert_eq!(world.connect("d1").get().unwrap(), 1.0);
    }
}
