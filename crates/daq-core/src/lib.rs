//! `daq-core`
//!
//! Core trait definitions and types shared by the scan orchestration engine,
//! its channel drivers and the command-line front end.
//!
//! ## Key Types
//!
//! - [`ChannelHandle`](channel::ChannelHandle): the asynchronous endpoint every
//!   positioner, detector, trigger and hook is reached through
//! - [`ChannelProvider`](channel::ChannelProvider): resolves names to handles
//! - [`ScanError`](error::ScanError): error taxonomy for configuration and execution
//! - [`Observable`](observable::Observable): watch-based value holder used for the
//!   status surface
//! - [`limits`]: slot counts, capacity bounds and numeric tolerances

pub mod channel;
pub mod error;
pub mod limits;
pub mod observable;

pub use channel::{
    ChannelHandle, ChannelMetadata, ChannelProvider, ConnectionState, PutStatus, SharedChannel,
};
pub use error::{DriverError, DriverErrorKind, ScanError, ScanResult};
pub use observable::Observable;
