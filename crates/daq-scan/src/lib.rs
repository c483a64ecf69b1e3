//! `daq-scan`
//!
//! Multi-axis scan orchestration. A [`Scan`] drives up to four positioners
//! through a trajectory, triggers its detectors at every point, records the
//! results into double-buffered arrays, and optionally retraces to a searched
//! mark (peak, valley, edge) when the pass is done.
//!
//! ## Modules
//!
//! - [`linear`]: start/increment/end/center/width resolution under freeze flags
//! - [`connection`]: resolves channel names and tracks per-slot connectivity
//! - [`barrier`]: counts outstanding completions for one phase
//! - [`timer`]: single-slot cancellable delays
//! - [`buffer`]: double buffers published as immutable snapshots
//! - [`post_scan`]: retrace policies and mark search
//! - [`preview`]: limit check and trajectory preview
//! - [`scan`]: the phase automaton
//! - [`control`]: start/pause/abort/kill
//! - [`arena`]: nested scans
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Example
//!
//! ```rust,ignore
//! use daq_scan::{ScanControl, ScanSetConfig, ScanArena};
//!
//! let config = ScanSetConfig::load_from(Path::new("config/scan.toml"))?;
//! let arena = ScanArena::build(&config, &provider)?;
//! let scan = arena.scan("energy").unwrap();
//! let mut outcomes = scan.subscribe_outcomes();
//! scan.request_start()?;
//! let outcome = outcomes.recv().await?;
//! let data = scan.buffers().snapshot();
//! ```

pub mod arena;
pub mod barrier;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod control;
pub mod linear;
pub mod post_scan;
pub mod preview;
pub mod scan;
pub mod timer;

pub use arena::{InnerScanLink, ScanArena, ScanId};
pub use buffer::{AcquisitionMode, BufferReader, BufferView, Snapshot};
pub use config::{
    DetectorConfig, HookConfig, PositionerConfig, ScanConfig, ScanSetConfig, TriggerConfig,
};
pub use connection::{ChannelRole, ChannelStatus, ConnectionTable};
pub use control::ScanControl;
pub use linear::{LinearField, StepMode, Trajectory};
pub use post_scan::RetracePolicy;
pub use preview::Preview;
pub use scan::{Phase, Scan, ScanOutcome, ScanStatus};
