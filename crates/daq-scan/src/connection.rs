//! Connection resolver.
//!
//! Resolves every configured channel name of a scan to a [`SharedChannel`],
//! keeps a per-slot [`ChannelStatus`] table, and spawns one watcher task per
//! channel that forwards connectivity (and, for positioners, value) changes to
//! the owning scan.
//!
//! Watchers hold only a `Weak` reference to their [`ConnectionListener`]; when
//! the scan is dropped they exit on their next wake-up.
//!
//! # Required channels
//!
//! A scan may start only when no configured channel is
//! [`ChannelStatus::NotConnected`]. Slots without a name are
//! [`ChannelStatus::NoName`] and simply do not participate. A positioner with
//! a configured readback needs both its drive and its readback.

use daq_core::channel::{ChannelMetadata, ChannelProvider, ConnectionState, SharedChannel};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Weak;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Readback name that records elapsed scan time instead of a channel value.
pub const TIME_READBACK: &str = "time";

/// Connectivity of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Connected and usable.
    Ok,
    /// Named but not (or no longer) connected.
    NotConnected,
    /// No channel configured for this slot.
    NoName,
}

impl ChannelStatus {
    /// Whether the slot is usable.
    pub fn is_ok(&self) -> bool {
        matches!(self, ChannelStatus::Ok)
    }
}

impl From<&ConnectionState> for ChannelStatus {
    fn from(state: &ConnectionState) -> Self {
        if state.is_connected() {
            ChannelStatus::Ok
        } else {
            ChannelStatus::NotConnected
        }
    }
}

/// Which slot a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "role", content = "slot")]
pub enum ChannelRole {
    /// Positioner drive (write).
    PositionerDrive(usize),
    /// Positioner readback (read).
    PositionerReadback(usize),
    /// Detector value.
    Detector(usize),
    /// Detector trigger.
    Trigger(usize),
    /// Before-scan hook.
    BeforeHook,
    /// After-scan hook.
    AfterHook,
}

impl ChannelRole {
    /// Whether losing this channel mid-scan ends the scan.
    ///
    /// Everything the scan writes to, plus positioner readbacks, is fatal;
    /// detectors only degrade the data.
    pub fn is_fatal_when_lost(&self) -> bool {
        !matches!(self, ChannelRole::Detector(_))
    }
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRole::PositionerDrive(i) => write!(f, "P{}", i + 1),
            ChannelRole::PositionerReadback(i) => write!(f, "R{}", i + 1),
            ChannelRole::Detector(i) => write!(f, "D{:02}", i + 1),
            ChannelRole::Trigger(i) => write!(f, "T{}", i + 1),
            ChannelRole::BeforeHook => write!(f, "BS"),
            ChannelRole::AfterHook => write!(f, "AS"),
        }
    }
}

// =============================================================================
// ConnectionTable
// =============================================================================

/// Per-slot connectivity bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTable {
    /// Positioner drives.
    pub drives: Vec<ChannelStatus>,
    /// Positioner readbacks.
    pub readbacks: Vec<ChannelStatus>,
    /// Detectors.
    pub detectors: Vec<ChannelStatus>,
    /// Triggers.
    pub triggers: Vec<ChannelStatus>,
    /// Before-scan hook.
    pub before: ChannelStatus,
    /// After-scan hook.
    pub after: ChannelStatus,
}

impl ConnectionTable {
    /// Status of one slot. Unknown slots read as [`ChannelStatus::NoName`].
    pub fn get(&self, role: ChannelRole) -> ChannelStatus {
        let slot = match role {
            ChannelRole::PositionerDrive(i) => self.drives.get(i),
            ChannelRole::PositionerReadback(i) => self.readbacks.get(i),
            ChannelRole::Detector(i) => self.detectors.get(i),
            ChannelRole::Trigger(i) => self.triggers.get(i),
            ChannelRole::BeforeHook => Some(&self.before),
            ChannelRole::AfterHook => Some(&self.after),
        };
        slot.copied().unwrap_or(ChannelStatus::NoName)
    }

    /// Update one slot. Returns the previous status.
    pub fn set(&mut self, role: ChannelRole, status: ChannelStatus) -> ChannelStatus {
        let slot = match role {
            ChannelRole::PositionerDrive(i) => self.drives.get_mut(i),
            ChannelRole::PositionerReadback(i) => self.readbacks.get_mut(i),
            ChannelRole::Detector(i) => self.detectors.get_mut(i),
            ChannelRole::Trigger(i) => self.triggers.get_mut(i),
            ChannelRole::BeforeHook => Some(&mut self.before),
            ChannelRole::AfterHook => Some(&mut self.after),
        };
        match slot {
            Some(slot) => std::mem::replace(slot, status),
            None => ChannelStatus::NoName,
        }
    }

    fn roles(&self) -> impl Iterator<Item = ChannelRole> + '_ {
        let drives = (0..self.drives.len()).map(ChannelRole::PositionerDrive);
        let readbacks = (0..self.readbacks.len()).map(ChannelRole::PositionerReadback);
        let detectors = (0..self.detectors.len()).map(ChannelRole::Detector);
        let triggers = (0..self.triggers.len()).map(ChannelRole::Trigger);
        drives
            .chain(readbacks)
            .chain(detectors)
            .chain(triggers)
            .chain([ChannelRole::BeforeHook, ChannelRole::AfterHook])
    }

    /// Every configured slot is connected.
    pub fn required_ok(&self) -> bool {
        self.roles()
            .all(|role| self.get(role) != ChannelStatus::NotConnected)
    }

    /// Configured slots that are not connected.
    pub fn missing(&self) -> Vec<ChannelRole> {
        self.roles()
            .filter(|role| self.get(*role) == ChannelStatus::NotConnected)
            .collect()
    }

    /// Fatal-when-lost slots that are not connected.
    pub fn lost_outputs(&self) -> Vec<ChannelRole> {
        self.roles()
            .filter(|role| role.is_fatal_when_lost())
            .filter(|role| self.get(*role) == ChannelStatus::NotConnected)
            .collect()
    }

    /// Flattened status list in slot order: drives, readbacks, detectors,
    /// triggers, before hook, after hook.
    pub fn bitmap(&self) -> Vec<ChannelStatus> {
        self.roles().map(|role| self.get(role)).collect()
    }

    /// A positioner can be driven: its drive is connected and its readback is
    /// connected or not configured.
    pub fn positioner_ok(&self, slot: usize) -> bool {
        self.get(ChannelRole::PositionerDrive(slot)).is_ok()
            && self.get(ChannelRole::PositionerReadback(slot)) != ChannelStatus::NotConnected
    }
}

// =============================================================================
// Resolved channels
// =============================================================================

/// Where a positioner's recorded position comes from.
#[derive(Clone)]
pub enum Readback {
    /// No readback configured.
    None,
    /// Seconds since scan start.
    Time,
    /// A readback channel.
    Channel(SharedChannel),
}

impl std::fmt::Debug for Readback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readback::None => write!(f, "None"),
            Readback::Time => write!(f, "Time"),
            Readback::Channel(ch) => write!(f, "Channel({})", ch.name()),
        }
    }
}

/// Names to resolve for one scan.
#[derive(Debug, Clone, Default)]
pub struct ChannelNames {
    /// Positioner drive names.
    pub drives: Vec<String>,
    /// Positioner readback names (`None` or `"time"` allowed).
    pub readbacks: Vec<Option<String>>,
    /// Detector names.
    pub detectors: Vec<String>,
    /// Trigger names (`None` for slots served by an inner scan).
    pub triggers: Vec<Option<String>>,
    /// Before-scan hook name.
    pub before: Option<String>,
    /// After-scan hook name.
    pub after: Option<String>,
}

/// Every handle a scan uses, by slot.
#[derive(Clone, Default)]
pub struct ChannelSet {
    /// Positioner drives.
    pub drives: Vec<Option<SharedChannel>>,
    /// Positioner readbacks.
    pub readbacks: Vec<Readback>,
    /// Detectors.
    pub detectors: Vec<Option<SharedChannel>>,
    /// Triggers.
    pub triggers: Vec<Option<SharedChannel>>,
    /// Before-scan hook.
    pub before: Option<SharedChannel>,
    /// After-scan hook.
    pub after: Option<SharedChannel>,
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |v: &[Option<SharedChannel>]| -> Vec<String> {
            v.iter()
                .map(|c| c.as_ref().map(|c| c.name().to_string()).unwrap_or_default())
                .collect()
        };
        f.debug_struct("ChannelSet")
            .field("drives", &names(&self.drives))
            .field("readbacks", &self.readbacks)
            .field("detectors", &names(&self.detectors))
            .field("triggers", &names(&self.triggers))
            .finish()
    }
}

fn named(name: Option<&str>) -> Option<&str> {
    name.map(str::trim).filter(|n| !n.is_empty())
}

impl ChannelSet {
    /// Resolve every name through `provider`. Trigger slots present in
    /// `links` use the given handle instead (inner-scan links).
    pub fn resolve(
        names: &ChannelNames,
        provider: &dyn ChannelProvider,
        links: &[(usize, SharedChannel)],
    ) -> Self {
        let connect = |name: Option<&str>| named(name).map(|n| provider.connect(n));

        let readbacks = names
            .readbacks
            .iter()
            .map(|name| match named(name.as_deref()) {
                None => Readback::None,
                Some(TIME_READBACK) => Readback::Time,
                Some(n) => Readback::Channel(provider.connect(n)),
            })
            .collect();

        let triggers = names
            .triggers
            .iter()
            .enumerate()
            .map(|(slot, name)| {
                links
                    .iter()
                    .find(|(s, _)| *s == slot)
                    .map(|(_, link)| link.clone())
                    .or_else(|| connect(name.as_deref()))
            })
            .collect();

        Self {
            drives: names.drives.iter().map(|n| connect(Some(n))).collect(),
            readbacks,
            detectors: names.detectors.iter().map(|n| connect(Some(n))).collect(),
            triggers,
            before: connect(names.before.as_deref()),
            after: connect(names.after.as_deref()),
        }
    }

    fn initial(channel: Option<&SharedChannel>) -> ChannelStatus {
        match channel {
            Some(ch) if ch.is_connected() => ChannelStatus::Ok,
            Some(_) => ChannelStatus::NotConnected,
            None => ChannelStatus::NoName,
        }
    }

    /// Status table as of now.
    pub fn table(&self) -> ConnectionTable {
        ConnectionTable {
            drives: self.drives.iter().map(|c| Self::initial(c.as_ref())).collect(),
            readbacks: self
                .readbacks
                .iter()
                .map(|r| match r {
                    Readback::None => ChannelStatus::NoName,
                    Readback::Time => ChannelStatus::Ok,
                    Readback::Channel(ch) => Self::initial(Some(ch)),
                })
                .collect(),
            detectors: self.detectors.iter().map(|c| Self::initial(c.as_ref())).collect(),
            triggers: self.triggers.iter().map(|c| Self::initial(c.as_ref())).collect(),
            before: Self::initial(self.before.as_ref()),
            after: Self::initial(self.after.as_ref()),
        }
    }

    /// Handle serving `role`, if any.
    pub fn handle(&self, role: ChannelRole) -> Option<&SharedChannel> {
        match role {
            ChannelRole::PositionerDrive(i) => self.drives.get(i)?.as_ref(),
            ChannelRole::PositionerReadback(i) => match self.readbacks.get(i)? {
                Readback::Channel(ch) => Some(ch),
                _ => None,
            },
            ChannelRole::Detector(i) => self.detectors.get(i)?.as_ref(),
            ChannelRole::Trigger(i) => self.triggers.get(i)?.as_ref(),
            ChannelRole::BeforeHook => self.before.as_ref(),
            ChannelRole::AfterHook => self.after.as_ref(),
        }
    }

    fn all(&self) -> Vec<(ChannelRole, SharedChannel)> {
        let mut out = Vec::new();
        let mut push = |role: ChannelRole, ch: Option<&SharedChannel>| {
            if let Some(ch) = ch {
                out.push((role, ch.clone()));
            }
        };
        for (i, ch) in self.drives.iter().enumerate() {
            push(ChannelRole::PositionerDrive(i), ch.as_ref());
        }
        for (i, rb) in self.readbacks.iter().enumerate() {
            if let Readback::Channel(ch) = rb {
                push(ChannelRole::PositionerReadback(i), Some(ch));
            }
        }
        for (i, ch) in self.detectors.iter().enumerate() {
            push(ChannelRole::Detector(i), ch.as_ref());
        }
        for (i, ch) in self.triggers.iter().enumerate() {
            push(ChannelRole::Trigger(i), ch.as_ref());
        }
        push(ChannelRole::BeforeHook, self.before.as_ref());
        push(ChannelRole::AfterHook, self.after.as_ref());
        out
    }

    /// Channel whose monitor marks positioner `slot` as fresh: its readback
    /// channel when configured, else its drive.
    fn freshness_source(&self, slot: usize) -> Option<SharedChannel> {
        match self.readbacks.get(slot) {
            Some(Readback::Channel(ch)) => Some(ch.clone()),
            _ => self.drives.get(slot).cloned().flatten(),
        }
    }
}

// =============================================================================
// Watchers
// =============================================================================

/// Receives connectivity and positioner-value events.
pub trait ConnectionListener: Send + Sync {
    /// A channel's connectivity changed (also called once at watch start).
    fn connection_changed(
        &self,
        role: ChannelRole,
        status: ChannelStatus,
        metadata: Option<ChannelMetadata>,
    );

    /// A positioner's monitored value updated.
    fn positioner_updated(&self, slot: usize, value: f64);
}

/// Owns the watcher tasks of one scan.
#[derive(Debug, Default)]
pub struct ConnectionResolver {
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionResolver {
    /// Resolver with no watchers running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn one connectivity watcher per channel and one value watcher per
    /// positioner. Any previously running watchers are stopped first.
    pub fn start(
        &self,
        runtime: &Handle,
        channels: &ChannelSet,
        listener: Weak<dyn ConnectionListener>,
    ) {
        let mut watchers = self.watchers.lock();
        for task in watchers.drain(..) {
            task.abort();
        }

        for (role, channel) in channels.all() {
            let rx = channel.connection();
            watchers.push(runtime.spawn(watch_connection(role, rx, listener.clone())));
        }
        for slot in 0..channels.drives.len() {
            if let Some(source) = channels.freshness_source(slot) {
                let rx = source.monitor();
                watchers.push(runtime.spawn(watch_value(slot, rx, listener.clone())));
            }
        }
        tracing::debug!(watchers = watchers.len(), "connection watchers started");
    }

    /// Stop every watcher.
    pub fn stop(&self) {
        for task in self.watchers.lock().drain(..) {
            task.abort();
        }
    }

    /// Number of running watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().iter().filter(|t| !t.is_finished()).count()
    }
}

impl Drop for ConnectionResolver {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_connection(
    role: ChannelRole,
    mut rx: watch::Receiver<ConnectionState>,
    listener: Weak<dyn ConnectionListener>,
) {
    loop {
        let state = rx.borrow_and_update().clone();
        let Some(target) = listener.upgrade() else {
            break;
        };
        target.connection_changed(role, ChannelStatus::from(&state), state.metadata().cloned());
        drop(target);
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn watch_value(
    slot: usize,
    mut rx: watch::Receiver<Option<f64>>,
    listener: Weak<dyn ConnectionListener>,
) {
    loop {
        let value = *rx.borrow_and_update();
        if let Some(value) = value {
            let Some(target) = listener.upgrade() else {
                break;
            };
            target.positioner_updated(slot, value);
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ConnectionTable {
        ConnectionTable {
            drives: vec![ChannelStatus::Ok, ChannelStatus::Ok],
            readbacks: vec![ChannelStatus::NoName, ChannelStatus::Ok],
            detectors: vec![ChannelStatus::Ok],
            triggers: vec![ChannelStatus::NoName],
            before: ChannelStatus::NoName,
            after: ChannelStatus::NoName,
        }
    }

    #[test]
    fn test_required_ok_ignores_unnamed() {
        let table = table();
        assert!(table.required_ok());
        assert!(table.positioner_ok(0));
        assert!(table.lost_outputs().is_empty());
    }

    #[test]
    fn test_detector_loss_is_not_fatal() {
        let mut table = table();
        table.set(ChannelRole::Detector(0), ChannelStatus::NotConnected);
        assert!(!table.required_ok());
        assert!(table.lost_outputs().is_empty());
        assert_eq!(table.missing(), vec![ChannelRole::Detector(0)]);
    }

    #[test]
    fn test_readback_loss_is_fatal() {
        let mut table = table();
        let prev = table.set(ChannelRole::PositionerReadback(1), ChannelStatus::NotConnected);
        assert_eq!(prev, ChannelStatus::Ok);
        assert!(!table.positioner_ok(1));
        assert_eq!(table.lost_outputs(), vec![ChannelRole::PositionerReadback(1)]);
    }

    #[test]
    fn test_bitmap_order() {
        let table = table();
        let bitmap = table.bitmap();
        assert_eq!(bitmap.len(), 2 + 2 + 1 + 1 + 2);
        assert_eq!(bitmap[2], ChannelStatus::NoName);
        assert_eq!(table.get(ChannelRole::Trigger(3)), ChannelStatus::NoName);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(ChannelRole::PositionerDrive(0).to_string(), "P1");
        assert_eq!(ChannelRole::Detector(9).to_string(), "D10");
    }
}
