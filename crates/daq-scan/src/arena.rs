//! Nested scans.
//!
//! A multi-dimensional scan is a set of scans where an outer scan's trigger
//! slot starts an inner scan and waits for it to finish. The relationship is
//! declared in configuration (`TriggerConfig::inner_scan`) and resolved once
//! here into an arena of [`Scan`]s addressed by [`ScanId`].
//!
//! Scans are built innermost first so every outer scan can be handed an
//! [`InnerScanLink`] for its inner scan at construction time.

use crate::config::ScanSetConfig;
use crate::control::ScanControl;
use crate::scan::Scan;
use async_trait::async_trait;
use daq_core::channel::{
    ChannelHandle, ChannelMetadata, ChannelProvider, ConnectionState, PutStatus, SharedChannel,
};
use daq_core::error::{DriverError, DriverErrorKind, ScanError, ScanResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Index of a scan in a [`ScanArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanId(usize);

impl ScanId {
    /// Position in the arena.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trigger endpoint that runs an inner scan.
///
/// Writing a non-zero value starts the inner scan; zero aborts it. A write
/// with completion resolves when the inner scan reports its outcome.
pub struct InnerScanLink {
    name: String,
    inner: Scan,
    connection: watch::Sender<ConnectionState>,
    monitor: watch::Sender<Option<f64>>,
}

impl InnerScanLink {
    /// Link serving `inner`.
    pub fn new(inner: Scan) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected(ChannelMetadata::default()));
        let (monitor, _) = watch::channel(Some(0.0));
        Self {
            name: format!("scan:{}", inner.name()),
            inner,
            connection,
            monitor,
        }
    }

    fn refused(&self, err: &ScanError) -> DriverError {
        DriverError::new(&self.name, DriverErrorKind::Busy, err.to_string())
    }
}

impl std::fmt::Debug for InnerScanLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerScanLink").field("name", &self.name).finish()
    }
}

#[async_trait]
impl ChannelHandle for InnerScanLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn get(&self) -> Result<f64, DriverError> {
        Ok(self.inner.core.current_point() as f64)
    }

    fn put(&self, value: f64) -> Result<(), DriverError> {
        if value != 0.0 {
            self.inner
                .request_start()
                .map_err(|err| self.refused(&err))
        } else {
            self.inner.request_abort();
            Ok(())
        }
    }

    async fn put_with_completion(&self, value: f64) -> PutStatus {
        if value == 0.0 {
            self.inner.request_abort();
            return PutStatus::Done;
        }
        let mut outcomes = self.inner.subscribe_outcomes();
        if let Err(err) = self.inner.request_start() {
            tracing::warn!(inner = %self.inner.name(), %err, "inner scan refused start");
            return PutStatus::Busy;
        }
        loop {
            match outcomes.recv().await {
                Ok(outcome) => {
                    tracing::debug!(
                        inner = %outcome.scan,
                        points = outcome.points,
                        aborted = outcome.aborted,
                        "inner scan finished"
                    );
                    return PutStatus::Done;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return PutStatus::Disconnected,
            }
        }
    }

    fn monitor(&self) -> watch::Receiver<Option<f64>> {
        self.monitor.subscribe()
    }
}

/// Every scan of a nested set.
#[derive(Debug)]
pub struct ScanArena {
    scans: Vec<Scan>,
    by_name: HashMap<String, ScanId>,
    inner: Vec<Option<ScanId>>,
    parent: Vec<Option<ScanId>>,
}

impl ScanArena {
    /// Build every scan of `config`, innermost first.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` for an invalid set or scan.
    pub fn build(config: &ScanSetConfig, provider: &dyn ChannelProvider) -> ScanResult<Self> {
        config.validate()?;
        let mut arena = Self {
            scans: Vec::with_capacity(config.scans.len()),
            by_name: HashMap::new(),
            inner: Vec::new(),
            parent: Vec::new(),
        };

        let mut remaining: Vec<_> = config.scans.iter().collect();
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|scan| {
                scan.inner_links()
                    .iter()
                    .all(|(_, inner)| arena.by_name.contains_key(*inner))
            });
            let Some(index) = ready else {
                return Err(ScanError::Configuration(
                    "nested scans cannot be ordered".into(),
                ));
            };
            let scan_config = remaining.swap_remove(index);

            let mut links: Vec<(usize, SharedChannel)> = Vec::new();
            let mut children = Vec::new();
            for (slot, inner_name) in scan_config.inner_links() {
                let Some(inner_id) = arena.id(inner_name) else {
                    continue;
                };
                let link = InnerScanLink::new(arena.scans[inner_id.0].clone());
                links.push((slot, Arc::new(link)));
                children.push(inner_id);
            }

            let scan = Scan::with_links(scan_config.clone(), provider, links)?;
            let id = ScanId(arena.scans.len());
            for inner_id in &children {
                arena.parent[inner_id.0] = Some(id);
            }
            let child = children.first().copied();
            arena.by_name.insert(scan_config.name.clone(), id);
            arena.scans.push(scan);
            arena.inner.push(child);
            arena.parent.push(None);
            tracing::debug!(scan = %scan_config.name, %id, inner = ?child, "scan added to arena");
        }
        Ok(arena)
    }

    /// Number of scans.
    pub fn len(&self) -> usize {
        self.scans.len()
    }

    /// Whether the arena holds no scans.
    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    /// Scan by id.
    pub fn get(&self, id: ScanId) -> Option<&Scan> {
        self.scans.get(id.0)
    }

    /// Id of the scan called `name`.
    pub fn id(&self, name: &str) -> Option<ScanId> {
        self.by_name.get(name).copied()
    }

    /// Scan called `name`.
    pub fn scan(&self, name: &str) -> Option<&Scan> {
        self.id(name).and_then(|id| self.get(id))
    }

    /// Whether no other scan triggers this one.
    pub fn is_outermost(&self, id: ScanId) -> bool {
        self.parent.get(id.0).is_some_and(Option::is_none)
    }

    /// Scan triggered by this one, if any.
    pub fn inner_of(&self, id: ScanId) -> Option<ScanId> {
        self.inner.get(id.0).copied().flatten()
    }

    /// Scan that triggers this one, if any.
    pub fn parent_of(&self, id: ScanId) -> Option<ScanId> {
        self.parent.get(id.0).copied().flatten()
    }

    /// Every outermost scan, in arena order.
    pub fn outermost(&self) -> Vec<ScanId> {
        (0..self.scans.len())
            .map(ScanId)
            .filter(|id| self.is_outermost(*id))
            .collect()
    }

    /// Iterate `(id, scan)` innermost first.
    pub fn iter(&self) -> impl Iterator<Item = (ScanId, &Scan)> {
        self.scans.iter().enumerate().map(|(i, s)| (ScanId(i), s))
    }

    /// Abort every scan, outermost first.
    pub fn abort_all(&self) {
        for scan in self.scans.iter().rev() {
            scan.request_abort();
        }
    }

    /// Kill every scan, outermost first.
    pub fn kill_all(&self) {
        for scan in self.scans.iter().rev() {
            scan.request_kill();
        }
    }
}
