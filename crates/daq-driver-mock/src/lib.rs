//! Mock channels for the scan engine
//!
//! This crate provides simulated positioners, readbacks, detectors, triggers
//! and hooks so scans can run without physical hardware. All mock channels use
//! async-safe operations (`tokio::time::sleep`, never `std::thread::sleep`).
//!
//! # Building a world
//!
//! ```rust,ignore
//! use daq_driver_mock::{ChannelKind, MockChannel, MockWorld};
//!
//! let world = MockWorld::new();
//! let motor = world.insert(MockChannel::builder("m1", ChannelKind::Motor).build());
//! let detector = world.insert(
//!     MockChannel::builder("d1", ChannelKind::Detector)
//!         .sequence(vec![1.0, 2.0, 5.0, 2.0, 1.0])
//!         .build(),
//! );
//! let trigger = world.insert(MockChannel::builder("t1", ChannelKind::Trigger).build());
//! trigger.link_detectors(vec![detector]);
//! // `world` is a ChannelProvider: pass it to Scan::new.
//! ```
//!
//! # Modes
//!
//! - Instant: every completion resolves immediately (unit tests)
//! - Realistic: motors, triggers and hooks take their configured time
//! - Chaos: realistic timing plus random injected failures

pub mod channel;
pub mod common;
pub mod world;

pub use channel::{ChannelKind, MockChannel, MockChannelBuilder, PeakProfile};
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use world::{MockChannelConfig, MockWorld, MockWorldConfig};
