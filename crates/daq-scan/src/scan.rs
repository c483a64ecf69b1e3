//! Phase state machine.
//!
//! A [`Scan`] steps its positioners through the trajectory, triggers its
//! detectors at each point, records every positioner and detector value, and
//! finally retraces and runs its after-scan hook.
//!
//! # Re-entry
//!
//! The automaton never blocks. Every invocation takes the per-scan lock,
//! advances at most one phase, issues asynchronous writes, and returns.
//! Progress resumes when one of these re-enters it:
//!
//! - a control request ([`ScanControl`](crate::control::ScanControl))
//! - the [`CompletionBarrier`] releasing after the phase's last completion
//! - the settle [`DelayTimer`] firing (settling delays, resume delay, and
//!   zero-delay "run again" requests)
//! - a connectivity or positioner-value change while a start is pending
//!
//! Completion tasks and timers hold a `Weak` reference to the scan, so a
//! dropped scan ends them quietly. A completion that belongs to an earlier
//! barrier arming (killed scan, expired deadline) is discarded by the barrier.
//!
//! # Phases
//!
//! ```text
//! Idle -> ScanPending -> BeforeScan -> BeforeScanWait
//!      -> MoveMotors -> CheckMotors -> TrigDetectors -> ReadDetectors
//!         (back to MoveMotors until every point is read)
//!      -> RetraceMove -> RetraceWait -> AfterScanDo -> AfterScanWait
//!      -> ScanDone -> Idle
//! ```
//!
//! On-the-fly trajectories insert `StartFly` after the first `CheckMotors`
//! and never stop their flying positioners again.

use crate::barrier::{BarrierEvent, BarrierKind, CompletionBarrier, Ticket};
use crate::buffer::{AcquisitionMode, BufferReader, BufferSet};
use crate::config::ScanConfig;
use crate::connection::{
    ChannelNames, ChannelRole, ChannelSet, ChannelStatus, ConnectionListener, ConnectionResolver,
    ConnectionTable, Readback,
};
use crate::linear::{Adjustment, LinearField, StepMode, Trajectory};
use crate::post_scan::{peak_search, RetracePolicy};
use crate::preview::{self, Limits, Preview};
use crate::timer::{DelayTimer, TimerTicket};
use daq_core::channel::{ChannelMetadata, ChannelProvider, PutStatus, SharedChannel};
use daq_core::error::{ScanError, ScanResult, ToleranceKind};
use daq_core::limits::MIN_DELAY;
use daq_core::observable::Observable;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

const OUTCOME_CAPACITY: usize = 16;

// =============================================================================
// Public types
// =============================================================================

/// Where the automaton is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not scanning.
    #[default]
    Idle,
    /// Start requested; waiting for channels to connect.
    ScanPending,
    /// Initialising a pass.
    InitScan,
    /// Issuing the before-scan hook.
    BeforeScan,
    /// Waiting for the before-scan hook.
    BeforeScanWait,
    /// Commanding positioners to the current point.
    MoveMotors,
    /// Waiting for positioners; checking readbacks.
    CheckMotors,
    /// Triggering detectors.
    TrigDetectors,
    /// Starting the continuous move of on-the-fly positioners.
    StartFly,
    /// Recording the current point.
    ReadDetectors,
    /// Commanding the retrace move.
    RetraceMove,
    /// Waiting for the retrace move.
    RetraceWait,
    /// Issuing the after-scan hook.
    AfterScanDo,
    /// Waiting for the after-scan hook.
    AfterScanWait,
    /// Pass finished; about to return to idle.
    ScanDone,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Status surface, published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanStatus {
    /// Scan name.
    pub scan: String,
    /// Current phase.
    pub phase: Phase,
    /// Current point.
    pub point: usize,
    /// Points per pass.
    pub points: usize,
    /// A start has been requested and not yet finished or aborted.
    pub executing: bool,
    /// A pass is in progress (including retrace and hooks).
    pub busy: bool,
    /// Pause asserted.
    pub paused: bool,
    /// A diagnostic needs attention.
    pub alert: bool,
    /// Diagnostic text.
    pub message: String,
    /// A detector dropped out or an endpoint reported busy this pass.
    pub degraded: bool,
    /// Clients still to release the current point.
    pub clients_pending: u32,
    /// Per-slot connectivity.
    pub connections: Option<ConnectionTable>,
    /// Commanded position of each positioner.
    pub desired: Vec<f64>,
    /// Mark found by the last peak/valley/edge search.
    pub mark: Option<usize>,
}

/// Sent once per pass when the scan returns to idle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanOutcome {
    /// Scan name.
    pub scan: String,
    /// Points acquired.
    pub points: usize,
    /// The pass ended early (abort, kill, fatal error).
    pub aborted: bool,
    /// Final diagnostic text.
    pub message: String,
    /// Buffer generation holding this pass's data.
    pub generation: u64,
}

/// What a timer re-entry does once it holds the lock.
#[derive(Debug, Clone, Copy)]
enum Wake {
    Process,
    ClientCheck,
}

// =============================================================================
// State
// =============================================================================

struct ScanState {
    phase: Phase,
    execute: bool,
    running: bool,
    busy: bool,
    paused: bool,
    alert: bool,
    message: String,
    degraded: bool,
    aborted: bool,
    packed: bool,
    cpt: usize,
    trajectory: Trajectory,
    connections: ConnectionTable,
    fresh: Vec<bool>,
    valid_positioners: Vec<bool>,
    valid_detectors: Vec<bool>,
    valid_triggers: Vec<bool>,
    prior: Vec<f64>,
    desired: Vec<f64>,
    commanded: Vec<f64>,
    retrace_targets: Vec<f64>,
    mark: Option<usize>,
    search_message: Option<String>,
    on_the_fly: bool,
    flying: bool,
    clients_pending: u32,
    waiting_for_clients: bool,
    barrier: CompletionBarrier,
    settle: DelayTimer,
    /// Wake kind of the pending settle timer.
    settle_wake: Option<Wake>,
    /// Wake held back by a pause, replayed on unpause.
    resume_wake: Option<Wake>,
    deadline: DelayTimer,
    buffers: BufferSet,
    started: Option<Instant>,
}

impl ScanState {
    fn target(&self, positioner: usize, point: usize) -> f64 {
        let prior = self.prior.get(positioner).copied().unwrap_or(0.0);
        self.trajectory
            .target(positioner, point, prior)
            .unwrap_or(prior)
    }

    fn step_mode(&self, positioner: usize) -> StepMode {
        self.trajectory
            .axis(positioner)
            .map(|a| a.mode)
            .unwrap_or_default()
    }

    fn increment(&self, positioner: usize) -> f64 {
        self.trajectory
            .axis(positioner)
            .map(|a| a.params.increment)
            .unwrap_or(0.0)
    }

    fn participating(&self, role: ChannelRole) -> bool {
        let latched = match role {
            ChannelRole::PositionerDrive(i) | ChannelRole::PositionerReadback(i) => {
                self.valid_positioners.get(i)
            }
            ChannelRole::Detector(i) => self.valid_detectors.get(i),
            ChannelRole::Trigger(i) => self.valid_triggers.get(i),
            ChannelRole::BeforeHook | ChannelRole::AfterHook => Some(&true),
        };
        latched.copied().unwrap_or(false) && self.connections.get(role).is_ok()
    }

    /// Value actually written: a repeat of the previous command is nudged so
    /// the endpoint sees a change.
    fn command(&mut self, positioner: usize, target: f64) -> f64 {
        let last = self.commanded.get(positioner).copied();
        let value = if last == Some(target) {
            target + f64::EPSILON * target.abs().max(1.0)
        } else {
            target
        };
        if let Some(slot) = self.commanded.get_mut(positioner) {
            *slot = value;
        }
        value
    }

    fn clear_clients(&mut self) {
        self.clients_pending = 0;
        self.waiting_for_clients = false;
    }

    fn snapshot(&self, scan: &str) -> ScanStatus {
        ScanStatus {
            scan: scan.to_string(),
            phase: self.phase,
            point: self.cpt,
            points: self.trajectory.npts(),
            executing: self.execute,
            busy: self.busy,
            paused: self.paused,
            alert: self.alert,
            message: self.message.clone(),
            degraded: self.degraded,
            clients_pending: self.clients_pending,
            connections: Some(self.connections.clone()),
            desired: self.desired.clone(),
            mark: self.mark,
        }
    }
}

// =============================================================================
// ScanCore
// =============================================================================

pub(crate) struct ScanCore {
    name: String,
    config: ScanConfig,
    channels: ChannelSet,
    resolver: ConnectionResolver,
    runtime: Handle,
    state: Mutex<ScanState>,
    status: Observable<ScanStatus>,
    outcomes: broadcast::Sender<ScanOutcome>,
    reader: BufferReader,
    weak: Weak<ScanCore>,
}

/// Handle to one scan. Clones share the scan.
#[derive(Clone)]
pub struct Scan {
    pub(crate) core: Arc<ScanCore>,
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("name", &self.core.name)
            .field("channels", &self.core.channels)
            .finish()
    }
}

impl Scan {
    /// Build a scan and start watching its channels.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` if the configuration is invalid or no
    /// runtime is available.
    pub fn new(config: ScanConfig, provider: &dyn ChannelProvider) -> ScanResult<Self> {
        Self::with_links(config, provider, Vec::new())
    }

    /// Like [`Scan::new`], with some trigger slots served by the given
    /// handles instead of named channels.
    ///
    /// # Errors
    ///
    /// See [`Scan::new`].
    pub fn with_links(
        config: ScanConfig,
        provider: &dyn ChannelProvider,
        links: Vec<(usize, SharedChannel)>,
    ) -> ScanResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            ScanError::Configuration(format!("scan '{}' needs a tokio runtime: {}", config.name, e))
        })?;

        let names = ChannelNames {
            drives: config.positioners.iter().map(|p| p.drive.clone()).collect(),
            readbacks: config.positioners.iter().map(|p| p.readback.clone()).collect(),
            detectors: config.detectors.iter().map(|d| d.channel.clone()).collect(),
            triggers: config.triggers.iter().map(|t| t.channel.clone()).collect(),
            before: config.before_scan.as_ref().map(|h| h.channel.clone()),
            after: config.after_scan.as_ref().map(|h| h.channel.clone()),
        };
        let channels = ChannelSet::resolve(&names, provider, &links);

        let (npts, clamp) = config.clamped_points();
        let npos = config.positioners.len();
        let ndet = config.detectors.len();
        let ntrig = config.triggers.len();
        let buffers = BufferSet::new(npos, ndet, config.max_points);
        let reader = buffers.reader();
        let trajectory = config.trajectory();
        // Slots with nothing to monitor never gate a pending start.
        let fresh = (0..npos)
            .map(|i| {
                channels.handle(ChannelRole::PositionerDrive(i)).is_none()
                    && channels.handle(ChannelRole::PositionerReadback(i)).is_none()
            })
            .collect();

        let mut state = ScanState {
            phase: Phase::Idle,
            execute: false,
            running: false,
            busy: false,
            paused: false,
            alert: false,
            message: String::new(),
            degraded: false,
            aborted: false,
            packed: true,
            cpt: 0,
            trajectory,
            connections: channels.table(),
            fresh,
            valid_positioners: vec![false; npos],
            valid_detectors: vec![false; ndet],
            valid_triggers: vec![false; ntrig],
            prior: vec![0.0; npos],
            desired: vec![0.0; npos],
            commanded: vec![f64::NAN; npos],
            retrace_targets: vec![0.0; npos],
            mark: None,
            search_message: None,
            on_the_fly: false,
            flying: false,
            clients_pending: 0,
            waiting_for_clients: false,
            barrier: CompletionBarrier::new(),
            settle: DelayTimer::new(),
            settle_wake: None,
            resume_wake: None,
            deadline: DelayTimer::new(),
            buffers,
            started: None,
        };
        let mut diagnostics: Vec<ScanError> = clamp.into_iter().collect();
        diagnostics.extend(state.trajectory.check_tables());
        if let Some(last) = diagnostics.last() {
            state.alert = true;
            state.message = last.to_string();
        }
        for (i, axis) in state.trajectory.axes().iter().enumerate() {
            state.desired[i] = axis.params.start;
        }
        let status = Observable::new("scan_status", state.snapshot(&config.name));
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let name = config.name.clone();

        let core = Arc::new_cyclic(|weak| ScanCore {
            name,
            config,
            channels,
            resolver: ConnectionResolver::new(),
            runtime,
            state: Mutex::new(state),
            status,
            outcomes,
            reader,
            weak: weak.clone(),
        });
        let listener: Weak<dyn ConnectionListener> = core.weak.clone();
        core.resolver.start(&core.runtime, &core.channels, listener);
        tracing::info!(scan = %core.name, points = npts, positioners = npos, detectors = ndet, "scan created");
        Ok(Self { core })
    }

    /// Scan name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Configuration the scan was built from.
    pub fn config(&self) -> &ScanConfig {
        &self.core.config
    }

    /// Current status.
    pub fn status(&self) -> ScanStatus {
        self.core.status.get()
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ScanStatus> {
        self.core.status.subscribe()
    }

    /// Subscribe to per-pass outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<ScanOutcome> {
        self.core.outcomes.subscribe()
    }

    /// Read handle for the published buffers.
    pub fn buffers(&self) -> BufferReader {
        self.core.reader.clone()
    }

    /// Per-slot connectivity.
    pub fn connections(&self) -> ConnectionTable {
        self.core.state.lock().connections.clone()
    }

    /// Copy of the current trajectory.
    pub fn trajectory(&self) -> Trajectory {
        self.core.state.lock().trajectory.clone()
    }

    /// Number of running connection watchers.
    pub fn watcher_count(&self) -> usize {
        self.core.resolver.watcher_count()
    }

    /// Write one linear field of one positioner.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while a pass is in progress,
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn set_field(&self, positioner: usize, field: LinearField, value: f64) -> ScanResult<Adjustment> {
        self.core
            .edit(|t| t.set_field(positioner, field, value))
    }

    /// Change the number of points.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while a pass is in progress.
    pub fn set_points(&self, npts: usize) -> ScanResult<Adjustment> {
        self.core.edit(|t| Ok(t.set_points(npts)))
    }

    /// Change one positioner's step mode.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while a pass is in progress,
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn set_step_mode(&self, positioner: usize, mode: StepMode) -> ScanResult<Adjustment> {
        self.core.edit(|t| t.set_step_mode(positioner, mode))
    }

    /// Load a positioner's table.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while a pass is in progress,
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn load_table(&self, positioner: usize, table: Vec<f64>) -> ScanResult<Adjustment> {
        self.core.edit(|t| {
            Ok(Adjustment {
                points_changed: false,
                diagnostics: t.load_table(positioner, table)?.into_iter().collect(),
            })
        })
    }

    /// Freeze or release one linear field.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while a pass is in progress,
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn set_freeze(&self, positioner: usize, field: LinearField, frozen: bool) -> ScanResult<()> {
        self.core
            .edit(|t| t.set_freeze(positioner, field, frozen).map(|_| Adjustment::default()))
            .map(|_| ())
    }

    /// Release every freeze flag (`true`) or restore the saved ones (`false`).
    pub fn set_freeze_override(&self, active: bool) {
        self.core.state.lock().trajectory.set_freeze_override(active);
    }

    /// Check every planned point against the positioners' limits.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while scanning, or the first
    /// `ScanError::LimitViolation`.
    pub fn check_limits(&self) -> ScanResult<()> {
        let mut st = self.core.state.lock();
        if st.execute || st.busy {
            return Err(ScanError::NotIdle);
        }
        let priors = self.core.read_priors_lenient();
        let limits = self.core.limits();
        let result = preview::check_limits(&st.trajectory, &priors, &limits, &[]);
        match &result {
            Ok(()) => {
                st.alert = false;
                st.message = "SCAN Values within limits".into();
            }
            Err(err) => {
                st.alert = true;
                st.message = err.to_string();
            }
        }
        self.core.publish(&st);
        result
    }

    /// Planned positions of every positioner, without moving anything.
    ///
    /// # Errors
    ///
    /// `ScanError::NotIdle` while scanning.
    pub fn preview(&self) -> ScanResult<Preview> {
        let st = self.core.state.lock();
        if st.execute || st.busy {
            return Err(ScanError::NotIdle);
        }
        let priors = self.core.read_priors_lenient();
        Ok(preview::preview(&st.trajectory, &priors))
    }

    /// A client has finished with the current point.
    pub fn release_client(&self) {
        let core = &self.core;
        let mut st = core.state.lock();
        if st.clients_pending == 0 {
            return;
        }
        st.clients_pending -= 1;
        if st.clients_pending == 0 && st.waiting_for_clients {
            st.waiting_for_clients = false;
            if st.paused {
                st.message = "Scan is paused ...".into();
            } else {
                st.message = "Scanning ...".into();
                core.schedule(&mut st, Duration::ZERO, Wake::Process);
            }
        }
        core.publish(&st);
    }

    /// Clear the alert flag and diagnostic text.
    pub fn clear_alert(&self) {
        let mut st = self.core.state.lock();
        st.alert = false;
        st.message.clear();
        self.core.publish(&st);
    }
}

// =============================================================================
// Control requests
// =============================================================================

impl ScanCore {
    pub(crate) fn current_point(&self) -> usize {
        self.state.lock().cpt
    }

    /// Apply a trajectory edit while idle and surface its diagnostics.
    fn edit<F>(&self, apply: F) -> ScanResult<Adjustment>
    where
        F: FnOnce(&mut Trajectory) -> ScanResult<Adjustment>,
    {
        let mut st = self.state.lock();
        if st.busy || st.execute {
            return Err(ScanError::NotIdle);
        }
        let adjustment = apply(&mut st.trajectory)?;
        for diag in &adjustment.diagnostics {
            tracing::warn!(scan = %self.name, "{}", diag);
        }
        if let Some(last) = adjustment.diagnostics.last() {
            st.alert = true;
            st.message = last.to_string();
        }
        if adjustment.points_changed {
            tracing::debug!(scan = %self.name, points = st.trajectory.npts(), "point count changed");
        }
        self.publish(&st);
        Ok(adjustment)
    }

    pub(crate) fn request_start(&self) -> ScanResult<()> {
        let mut st = self.state.lock();
        let result = if st.paused {
            st.message = "Scan is paused".into();
            Err(ScanError::Paused)
        } else if st.execute || st.busy {
            st.message = "Already scanning".into();
            Err(ScanError::AlreadyScanning)
        } else {
            st.execute = true;
            if st.connections.required_ok() {
                st.alert = false;
                self.process(&mut st);
            } else {
                let missing = st.connections.missing();
                st.alert = true;
                st.message = "Waiting for channels to connect".into();
                st.phase = Phase::ScanPending;
                tracing::info!(scan = %self.name, ?missing, "scan pending on connections");
            }
            Ok(())
        };
        self.publish(&st);
        result
    }

    pub(crate) fn request_pause(&self, paused: bool) {
        let mut st = self.state.lock();
        if st.paused == paused {
            return;
        }
        st.paused = paused;
        if paused {
            if st.settle.cancel() {
                st.resume_wake = st.settle_wake.take();
            }
            st.message = "Scan pause asserted".into();
            tracing::info!(scan = %self.name, point = st.cpt, "pause asserted");
        } else {
            st.message = "Scan pause rescinded".into();
            tracing::info!(scan = %self.name, point = st.cpt, "pause rescinded");
            if st.busy && st.barrier.outstanding() == 0 {
                if st.waiting_for_clients {
                    st.message = "Waiting for client".into();
                } else {
                    let resume = self.config.resume_delay;
                    match st.resume_wake.take().unwrap_or(Wake::Process) {
                        Wake::Process => self.schedule(&mut st, resume, Wake::Process),
                        Wake::ClientCheck => {
                            let delay = resume.max(self.config.detector_settle);
                            self.schedule(&mut st, delay, Wake::ClientCheck);
                        }
                    }
                }
            }
        }
        self.publish(&st);
    }

    pub(crate) fn request_abort(&self) {
        let mut st = self.state.lock();
        if st.execute {
            st.execute = false;
            st.message = "Abort in progress...".into();
            tracing::info!(scan = %self.name, point = st.cpt, "abort requested");
            self.process(&mut st);
        } else if st.phase != Phase::Idle {
            self.kill(&mut st);
        } else {
            st.message = " ".into();
        }
        self.publish(&st);
    }

    pub(crate) fn request_kill(&self) {
        let mut st = self.state.lock();
        self.kill(&mut st);
        self.publish(&st);
    }

    fn kill(&self, st: &mut ScanState) {
        if st.phase == Phase::Idle && !st.busy {
            st.execute = false;
            st.running = false;
            st.message = " ".into();
            return;
        }
        let note = if st.barrier.outstanding() > 0 {
            match st.barrier.kind() {
                BarrierKind::Trigger => "NOTE: detector still active",
                BarrierKind::Positioner | BarrierKind::Hook => "NOTE: positioner still active",
            }
        } else {
            " "
        };
        st.clear_clients();
        let dropped = st.barrier.invalidate();
        st.settle.cancel();
        st.settle_wake = None;
        st.resume_wake = None;
        st.deadline.cancel();
        if !st.packed {
            self.pack_data(st);
        }
        st.alert = false;
        st.message = note.into();
        let was_busy = st.busy;
        st.execute = false;
        st.running = false;
        st.busy = false;
        st.phase = Phase::Idle;
        tracing::info!(scan = %self.name, point = st.cpt, dropped, "scan killed");
        if was_busy {
            st.aborted = true;
            self.notify_outcome(st);
        }
    }
}

// =============================================================================
// Automaton
// =============================================================================

impl ScanCore {
    fn process(&self, st: &mut ScanState) {
        if st.execute {
            if st.paused {
                st.message = "Scan is paused ...".into();
                return;
            }
            if st.waiting_for_clients {
                st.message = "waiting for client ...".into();
                return;
            }
        }

        if st.phase == Phase::ScanPending {
            if !st.execute {
                st.phase = Phase::Idle;
                st.alert = false;
                st.message = " ".into();
                st.running = false;
                return;
            }
            if !self.ready_to_start(st) {
                return;
            }
            st.alert = false;
        }

        if st.busy && st.execute && st.barrier.outstanding() > 0 {
            st.message = if st.paused { "Scan is paused" } else { "Already busy!" }.into();
            return;
        }

        if !st.running && st.execute {
            if st.busy {
                return;
            }
            self.begin(st);
        } else if st.running && !st.execute {
            if st.barrier.outstanding() > 0 {
                if !st.packed {
                    self.pack_data(st);
                }
                let remaining = st.barrier.drain();
                st.message = "Abort: waiting for callback".into();
                tracing::info!(scan = %self.name, remaining, "abort draining completions");
                return;
            }
            st.message = "Scan aborted by operator".into();
            st.clear_clients();
            st.aborted = true;
            st.settle.cancel();
            tracing::warn!(scan = %self.name, point = st.cpt, "scan aborted by operator");
            self.end_scan(st);
        } else if st.phase == Phase::BeforeScanWait {
            self.init_scan(st);
        } else if st.execute {
            let lost = st
                .connections
                .lost_outputs()
                .into_iter()
                .find(|role| st.loss_ends_pass(*role));
            if let Some(role) = lost {
                let channel = self.channel_name(role);
                self.diagnostic(st, ScanError::ConnectionLost { channel });
                st.execute = false;
                st.aborted = true;
                self.end_scan(st);
            } else {
                self.cont_scan(st);
            }
        } else if st.busy {
            if st.barrier.outstanding() > 0 {
                return;
            }
            if !st.packed {
                self.pack_data(st);
            }
            match st.phase {
                Phase::RetraceWait => self.after_scan(st),
                Phase::AfterScanWait | Phase::ScanDone => st.phase = Phase::ScanDone,
                other => tracing::debug!(scan = %self.name, phase = %other, "nothing to finish"),
            }
        }

        if st.busy && st.phase == Phase::ScanDone {
            st.busy = false;
            st.phase = Phase::Idle;
            tracing::info!(
                scan = %self.name,
                points = st.cpt,
                aborted = st.aborted,
                degraded = st.degraded,
                "scan finished"
            );
            self.notify_outcome(st);
        }
        st.running = st.execute;
    }

    fn ready_to_start(&self, st: &ScanState) -> bool {
        st.connections.required_ok() && st.fresh.iter().all(|f| *f)
    }

    fn begin(&self, st: &mut ScanState) {
        st.started = Some(Instant::now());
        st.packed = false;
        st.aborted = false;
        st.degraded = false;
        st.mark = None;
        st.search_message = None;
        st.clear_clients();
        st.barrier.invalidate();
        st.resume_wake = None;
        st.phase = Phase::InitScan;
        st.busy = true;
        tracing::info!(scan = %self.name, points = st.trajectory.npts(), "scan started");
        self.init_scan(st);
    }

    fn init_scan(&self, st: &mut ScanState) {
        let npos = self.config.positioners.len();
        st.cpt = 0;
        st.valid_positioners = (0..npos).map(|i| st.connections.positioner_ok(i)).collect();
        st.valid_detectors = (0..self.config.detectors.len())
            .map(|i| st.connections.get(ChannelRole::Detector(i)).is_ok())
            .collect();
        st.valid_triggers = (0..self.config.triggers.len())
            .map(|i| st.connections.get(ChannelRole::Trigger(i)).is_ok())
            .collect();

        for i in 0..npos {
            if !st.valid_positioners[i] {
                continue;
            }
            let read = self
                .channels
                .handle(ChannelRole::PositionerDrive(i))
                .map(|ch| ch.get());
            match read {
                Some(Ok(value)) => st.prior[i] = value,
                _ => {
                    self.refuse_start(st, "Can't get current position".into());
                    return;
                }
            }
        }

        for diag in st.trajectory.check_tables() {
            self.diagnostic(st, diag);
        }
        let limits = self.limits();
        if let Err(err) =
            preview::check_limits(&st.trajectory, &st.prior, &limits, &st.valid_positioners)
        {
            self.refuse_start(st, err.to_string());
            return;
        }

        for i in 0..npos {
            st.desired[i] = st.target(i, 0);
        }
        st.on_the_fly = st.trajectory.is_on_the_fly();
        st.flying = false;

        let run_before = st.phase != Phase::BeforeScanWait && st.connections.before.is_ok();
        if run_before {
            st.phase = Phase::BeforeScan;
            st.message = "Before Scan FLNK ...".into();
        } else {
            st.phase = Phase::MoveMotors;
            if !st.alert {
                st.message = "Scanning ...".into();
            }
        }
        self.do_puts(st);
    }

    /// A start that fails before any write: back to idle with an alert.
    fn refuse_start(&self, st: &mut ScanState, message: String) {
        tracing::warn!(scan = %self.name, %message, "scan refused");
        st.alert = true;
        st.message = message;
        st.execute = false;
        st.busy = false;
        st.packed = true;
        st.aborted = true;
        st.phase = Phase::Idle;
        self.notify_outcome(st);
    }

    fn cont_scan(&self, st: &mut ScanState) {
        match st.phase {
            Phase::TrigDetectors => self.do_puts(st),
            Phase::CheckMotors => {
                if !st.flying {
                    if let Err(err) = self.check_readbacks(st) {
                        self.diagnostic(st, err);
                        st.aborted = true;
                        self.end_scan(st);
                        return;
                    }
                }
                if st.on_the_fly && !st.flying {
                    for i in 0..self.config.positioners.len() {
                        if st.valid_positioners[i] && st.step_mode(i) == StepMode::OnTheFly {
                            let prior = st.prior[i];
                            st.desired[i] = st.trajectory.fly_end(i, prior).unwrap_or(prior);
                        }
                    }
                }
                let has_triggers = st.valid_triggers.iter().any(|t| *t);
                if !st.flying && (has_triggers || st.on_the_fly) {
                    st.phase = if st.on_the_fly {
                        Phase::StartFly
                    } else {
                        Phase::TrigDetectors
                    };
                    self.do_puts(st);
                    return;
                }
                self.read_detectors(st);
            }
            Phase::ReadDetectors => self.read_detectors(st),
            other => tracing::debug!(scan = %self.name, phase = %other, "nothing to continue"),
        }
    }

    fn check_readbacks(&self, st: &ScanState) -> ScanResult<()> {
        for (i, p) in self.config.positioners.iter().enumerate() {
            let tolerance = p.readback_tolerance;
            if tolerance == 0.0 || !st.valid_positioners[i] {
                continue;
            }
            let Some(Readback::Channel(channel)) = self.channels.readbacks.get(i) else {
                continue;
            };
            if !st.connections.get(ChannelRole::PositionerReadback(i)).is_ok()
                || !st.connections.get(ChannelRole::PositionerDrive(i)).is_ok()
            {
                continue;
            }
            let Ok(readback) = channel.get() else {
                continue;
            };
            let commanded = st.desired[i];
            let error = (commanded - readback).abs();
            let kind = if tolerance > 0.0 && error > tolerance {
                Some(ToleranceKind::Delta)
            } else if tolerance < 0.0
                && st.step_mode(i) != StepMode::Table
                && error > (st.increment(i) * tolerance.round()).abs()
            {
                Some(ToleranceKind::StepSize)
            } else {
                None
            };
            if let Some(kind) = kind {
                return Err(ScanError::ReadbackDeviation {
                    positioner: i,
                    commanded,
                    readback,
                    kind,
                });
            }
        }
        Ok(())
    }

    fn read_detectors(&self, st: &mut ScanState) {
        let npts = st.trajectory.npts();
        if self.config.acquisition == AcquisitionMode::BulkArray {
            self.read_arrays(st, npts);
            st.cpt = npts;
        } else {
            self.read_point(st);
            st.cpt += 1;
        }

        if st.cpt < npts {
            let point = st.cpt;
            for i in 0..self.config.positioners.len() {
                if st.valid_positioners[i] && st.step_mode(i) != StepMode::OnTheFly {
                    st.desired[i] = st.target(i, point);
                }
            }
            st.phase = Phase::MoveMotors;
            self.do_puts(st);
        } else {
            self.end_scan(st);
            st.message = match &st.search_message {
                Some(search) => format!("SCAN Complete: {}", search),
                None => "SCAN Complete".into(),
            };
        }
    }

    fn positioner_value(&self, st: &ScanState, i: usize) -> f64 {
        match self.channels.readbacks.get(i) {
            Some(Readback::Channel(channel))
                if st.connections.get(ChannelRole::PositionerReadback(i)).is_ok() =>
            {
                return channel.get().unwrap_or(0.0);
            }
            Some(Readback::Time) => {
                return st
                    .started
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
            }
            _ => {}
        }
        if !st.connections.get(ChannelRole::PositionerDrive(i)).is_ok() {
            return 0.0;
        }
        if st.flying && st.step_mode(i) == StepMode::OnTheFly {
            match st.cpt.checked_sub(1) {
                Some(previous) => {
                    st.buffers.positioner_value(i, previous).unwrap_or(0.0) + st.increment(i)
                }
                None => st.target(i, 0),
            }
        } else {
            st.desired[i]
        }
    }

    fn read_point(&self, st: &mut ScanState) {
        let point = st.cpt;
        for i in 0..self.config.positioners.len() {
            let value = self.positioner_value(st, i);
            if let Err(err) = st.buffers.record_positioner(i, point, value) {
                tracing::error!(scan = %self.name, positioner = i, point, %err, "positioner record failed");
            }
        }

        let mode = self.config.acquisition;
        for d in 0..self.config.detectors.len() {
            let role = ChannelRole::Detector(d);
            let value = if !st.valid_detectors[d] {
                0.0
            } else if st.connections.get(role).is_ok() {
                match self.channels.handle(role).map(|ch| ch.get()) {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => {
                        tracing::warn!(scan = %self.name, detector = d, %err, "detector read failed");
                        0.0
                    }
                    None => 0.0,
                }
            } else {
                st.degraded = true;
                0.0
            };
            let mode = if st.valid_detectors[d] {
                mode
            } else {
                AcquisitionMode::PointByPoint
            };
            if let Err(err) = st.buffers.record_detector(d, point, value, mode) {
                tracing::error!(scan = %self.name, detector = d, point, %err, "detector record failed");
            }
        }
        tracing::trace!(scan = %self.name, point, "point recorded");
    }

    fn read_arrays(&self, st: &mut ScanState, npts: usize) {
        let is_array = |meta: Option<ChannelMetadata>| meta.is_some_and(|m| m.element_count > 1);

        for i in 0..self.config.positioners.len() {
            let values: Vec<f64> = match self.channels.readbacks.get(i) {
                Some(Readback::Channel(channel))
                    if st.connections.get(ChannelRole::PositionerReadback(i)).is_ok()
                        && is_array(channel.metadata()) =>
                {
                    channel.get_array(npts).unwrap_or_default()
                }
                _ if st.connections.get(ChannelRole::PositionerDrive(i)).is_ok() => {
                    (0..npts).map(|p| st.target(i, p)).collect()
                }
                _ => (0..npts).map(|p| p as f64).collect(),
            };
            if let Err(err) = st.buffers.record_positioner_array(i, &values) {
                tracing::error!(scan = %self.name, positioner = i, %err, "positioner array record failed");
            }
        }

        for d in 0..self.config.detectors.len() {
            let role = ChannelRole::Detector(d);
            let values = match self.channels.handle(role) {
                Some(channel) if st.valid_detectors[d] && st.connections.get(role).is_ok() => {
                    if is_array(channel.metadata()) {
                        channel.get_array(npts).unwrap_or_default()
                    } else {
                        vec![channel.get().unwrap_or(0.0); npts]
                    }
                }
                _ => vec![0.0; npts],
            };
            if let Err(err) = st.buffers.record_detector_array(d, &values) {
                tracing::error!(scan = %self.name, detector = d, %err, "detector array record failed");
            }
        }
    }

    fn end_scan(&self, st: &mut ScanState) {
        if !st.packed {
            self.pack_data(st);
        }
        st.execute = false;
        st.settle.cancel();
        if self.config.retrace.moves() && st.valid_positioners.iter().any(|v| *v) {
            st.phase = Phase::RetraceMove;
            self.do_puts(st);
        } else {
            self.after_scan(st);
        }
    }

    fn after_scan(&self, st: &mut ScanState) {
        if st.connections.after.is_ok() {
            st.phase = Phase::AfterScanDo;
            self.do_puts(st);
        } else {
            st.phase = Phase::ScanDone;
        }
    }

    fn pack_data(&self, st: &mut ScanState) {
        let points = st.cpt;
        let view = st.buffers.finalize(points, self.config.acquisition);
        st.packed = true;

        let policy = self.config.retrace;
        if !policy.searches() {
            return;
        }
        let data = view
            .detector(self.config.reference_detector)
            .map(|s| s.acquired().to_vec())
            .unwrap_or_default();
        let positions = st
            .valid_positioners
            .iter()
            .position(|v| *v)
            .and_then(|i| view.positioner(i))
            .map(|s| s.acquired().to_vec())
            .unwrap_or_else(|| (0..points).map(|p| p as f64).collect());

        let search = peak_search(&data, &positions, policy, self.config.peak_smoothing_passes);
        st.mark = search.mark;
        st.search_message = Some(search.message.clone());
        match search.mark {
            Some(mark) => {
                for i in 0..self.config.positioners.len() {
                    st.retrace_targets[i] = view
                        .positioner(i)
                        .and_then(|s| s.get(mark).copied())
                        .unwrap_or(st.prior[i]);
                }
                tracing::info!(scan = %self.name, mark, "{}", search.message);
                st.message = search.message;
            }
            None => {
                st.retrace_targets.clone_from(&st.prior);
                tracing::warn!(scan = %self.name, "{}", search.message);
                st.alert = true;
                st.message = search.message;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    fn do_puts(&self, st: &mut ScanState) {
        if st.paused {
            st.message = "Scan paused by operator".into();
            return;
        }
        match st.phase {
            Phase::MoveMotors | Phase::StartFly => self.move_positioners(st),
            Phase::TrigDetectors => self.trigger_detectors(st, Vec::new()),
            Phase::BeforeScan => self.before_scan(st),
            Phase::RetraceMove => self.retrace(st),
            Phase::AfterScanDo => self.after_scan_do(st),
            other => tracing::debug!(scan = %self.name, phase = %other, "no writes for phase"),
        }
    }

    fn move_positioners(&self, st: &mut ScanState) {
        let start_fly = st.phase == Phase::StartFly;
        let mut moves = Vec::new();
        for i in 0..self.config.positioners.len() {
            let role = ChannelRole::PositionerDrive(i);
            if !st.participating(role) {
                continue;
            }
            let fly = st.step_mode(i) == StepMode::OnTheFly;
            if (fly && st.cpt != 0) || (start_fly && !fly) {
                continue;
            }
            let Some(channel) = self.channels.handle(role) else {
                continue;
            };
            let value = st.command(i, st.desired[i]);
            if start_fly && fly {
                if let Err(err) = channel.put(value) {
                    self.diagnostic(st, ScanError::Driver(err));
                }
                st.flying = true;
                tracing::debug!(scan = %self.name, positioner = i, target = value, "flying");
            } else {
                moves.push((role, channel.clone(), value));
            }
        }

        if !moves.is_empty() {
            st.phase = Phase::CheckMotors;
            if !st.flying {
                self.issue(st, BarrierKind::Positioner, moves);
                return;
            }
        }
        self.trigger_detectors(st, moves);
    }

    /// Trigger every participating detector. `pending` carries positioner
    /// moves issued in the same arming (start of an on-the-fly pass).
    fn trigger_detectors(&self, st: &mut ScanState, pending: Vec<(ChannelRole, SharedChannel, f64)>) {
        st.phase = if st.on_the_fly {
            Phase::CheckMotors
        } else {
            Phase::ReadDetectors
        };
        st.clients_pending = self.config.wait_for_clients;

        let mut ops = pending;
        for (i, t) in self.config.triggers.iter().enumerate() {
            let role = ChannelRole::Trigger(i);
            if !st.participating(role) {
                continue;
            }
            if let Some(channel) = self.channels.handle(role) {
                ops.push((role, channel.clone(), t.value));
            }
        }

        if ops.is_empty() {
            let delay = self.config.detector_settle;
            if delay < MIN_DELAY {
                self.client_check(st);
            } else {
                self.schedule(st, delay, Wake::ClientCheck);
            }
            return;
        }
        self.issue(st, BarrierKind::Trigger, ops);
    }

    fn before_scan(&self, st: &mut ScanState) {
        st.phase = Phase::BeforeScanWait;
        let (Some(hook), Some(channel)) = (&self.config.before_scan, &self.channels.before) else {
            self.schedule(st, Duration::ZERO, Wake::Process);
            return;
        };
        if hook.wait {
            self.issue(
                st,
                BarrierKind::Hook,
                vec![(ChannelRole::BeforeHook, channel.clone(), hook.value)],
            );
        } else {
            if let Err(err) = channel.put(hook.value) {
                self.diagnostic(st, ScanError::Driver(err));
            }
            self.schedule(st, Duration::ZERO, Wake::Process);
        }
    }

    fn retrace(&self, st: &mut ScanState) {
        let policy = self.config.retrace;
        let mut moves = Vec::new();
        if policy.moves() {
            for i in 0..self.config.positioners.len() {
                let role = ChannelRole::PositionerDrive(i);
                if !st.participating(role) {
                    continue;
                }
                let Some(channel) = self.channels.handle(role) else {
                    continue;
                };
                let target = match policy {
                    RetracePolicy::Prior => st.prior[i],
                    RetracePolicy::Start => st.target(i, 0),
                    _ => st.retrace_targets[i],
                };
                st.desired[i] = target;
                let value = st.command(i, target);
                moves.push((role, channel.clone(), value));
            }
        }
        if moves.is_empty() {
            st.phase = Phase::AfterScanDo;
            self.after_scan_do(st);
        } else {
            st.phase = Phase::RetraceWait;
            tracing::debug!(scan = %self.name, %policy, moves = moves.len(), "retrace");
            self.issue(st, BarrierKind::Positioner, moves);
        }
    }

    fn after_scan_do(&self, st: &mut ScanState) {
        if let (Some(hook), Some(channel)) = (&self.config.after_scan, &self.channels.after) {
            if st.connections.after.is_ok() {
                if hook.wait {
                    st.phase = Phase::AfterScanWait;
                    self.issue(
                        st,
                        BarrierKind::Hook,
                        vec![(ChannelRole::AfterHook, channel.clone(), hook.value)],
                    );
                } else if let Err(err) = channel.put(hook.value) {
                    self.diagnostic(st, ScanError::Driver(err));
                }
            }
        }
        if st.phase == Phase::AfterScanDo {
            st.phase = Phase::ScanDone;
        }
    }

    /// Arm the barrier for `ops` and issue them.
    fn issue(&self, st: &mut ScanState, kind: BarrierKind, ops: Vec<(ChannelRole, SharedChannel, f64)>) {
        let timeout = self.config.completion_timeout;
        let ticket = st.barrier.expect(kind, ops.len(), timeout);
        if let Some(timeout) = timeout.filter(|_| !ops.is_empty()) {
            let weak = self.weak.clone();
            st.deadline.schedule(&self.runtime, timeout, move |timer| {
                if let Some(core) = weak.upgrade() {
                    core.on_deadline(timer, ticket);
                }
            });
        }
        tracing::trace!(scan = %self.name, %kind, count = ops.len(), generation = ticket.generation, "barrier armed");
        for (role, channel, value) in ops {
            let weak = self.weak.clone();
            self.runtime.spawn(async move {
                let status = channel.put_with_completion(value).await;
                if let Some(core) = weak.upgrade() {
                    core.on_completion(ticket, role, status);
                }
            });
        }
    }

    // -------------------------------------------------------------------------
    // Re-entry
    // -------------------------------------------------------------------------

    fn schedule(&self, st: &mut ScanState, delay: Duration, wake: Wake) {
        st.settle_wake = Some(wake);
        let weak = self.weak.clone();
        st.settle.schedule(&self.runtime, delay, move |ticket| {
            if let Some(core) = weak.upgrade() {
                core.on_timer(ticket, wake);
            }
        });
    }

    fn on_timer(&self, ticket: TimerTicket, wake: Wake) {
        let mut st = self.state.lock();
        if !st.settle.fire(ticket) {
            return;
        }
        st.settle_wake = None;
        match wake {
            Wake::Process => self.process(&mut st),
            Wake::ClientCheck => self.client_check(&mut st),
        }
        self.publish(&st);
    }

    fn on_deadline(&self, timer: TimerTicket, ticket: Ticket) {
        let mut st = self.state.lock();
        if !st.deadline.fire(timer) {
            return;
        }
        let Some(outstanding) = st.barrier.expire(ticket) else {
            return;
        };
        let err = ScanError::Timeout {
            phase: st.phase.to_string(),
            outstanding,
        };
        self.diagnostic(&mut st, err);
        if st.execute {
            st.execute = false;
            st.running = false;
            st.aborted = true;
            st.clear_clients();
            self.end_scan(&mut st);
        } else if st.busy {
            match st.phase {
                Phase::RetraceWait => self.after_scan(&mut st),
                _ => st.phase = Phase::ScanDone,
            }
        }
        if st.busy && st.phase == Phase::ScanDone {
            self.schedule(&mut st, Duration::ZERO, Wake::Process);
        }
        self.publish(&st);
    }

    fn on_completion(&self, ticket: Ticket, role: ChannelRole, status: PutStatus) {
        let mut st = self.state.lock();
        let event = st.barrier.complete(ticket);
        if event == BarrierEvent::Stale {
            tracing::trace!(scan = %self.name, %role, generation = ticket.generation, ?status, "stale completion dropped");
            return;
        }
        match &status {
            PutStatus::Done => {}
            PutStatus::Busy => {
                let what = match role {
                    ChannelRole::PositionerDrive(i) => format!("Positioner {}", i + 1),
                    ChannelRole::Trigger(i) => format!("Detector trigger {}", i + 1),
                    other => other.to_string(),
                };
                st.degraded = true;
                self.diagnostic(&mut st, ScanError::Busy { what });
            }
            PutStatus::Disconnected => {
                self.mark_disconnected(&mut st, role);
            }
            PutStatus::TimedOut | PutStatus::Failed(_) => {
                st.degraded = true;
                tracing::warn!(scan = %self.name, %role, ?status, "write did not complete cleanly");
            }
        }

        match event {
            BarrierEvent::Released => {
                st.deadline.cancel();
                tracing::trace!(scan = %self.name, %role, "barrier released");
                self.released(&mut st, ticket.kind);
            }
            BarrierEvent::Pending { remaining } => {
                tracing::trace!(scan = %self.name, %role, remaining, "completion");
            }
            BarrierEvent::Absorbed { remaining } => {
                tracing::trace!(scan = %self.name, %role, remaining, "completion absorbed");
                if remaining == 0 {
                    st.deadline.cancel();
                    self.process(&mut st);
                }
            }
            BarrierEvent::Stale => {}
        }
        self.publish(&st);
    }

    fn released(&self, st: &mut ScanState, kind: BarrierKind) {
        if st.phase == Phase::Idle {
            st.message = " ".into();
            return;
        }
        if st.paused {
            st.resume_wake = Some(match kind {
                BarrierKind::Trigger => Wake::ClientCheck,
                BarrierKind::Positioner | BarrierKind::Hook => Wake::Process,
            });
            st.message = "Scan paused by operator".into();
            return;
        }
        match kind {
            BarrierKind::Trigger => {
                let delay = self.config.detector_settle;
                if delay < MIN_DELAY {
                    self.client_check(st);
                } else {
                    self.schedule(st, delay, Wake::ClientCheck);
                }
            }
            BarrierKind::Positioner | BarrierKind::Hook => {
                let delay = self.config.positioner_settle;
                if st.phase != Phase::CheckMotors || delay < MIN_DELAY {
                    self.schedule(st, Duration::ZERO, Wake::Process);
                } else {
                    self.schedule(st, delay, Wake::Process);
                }
            }
        }
    }

    fn client_check(&self, st: &mut ScanState) {
        if st.clients_pending > 0 {
            st.waiting_for_clients = true;
            st.message = "Waiting for client".into();
        } else {
            self.schedule(st, Duration::ZERO, Wake::Process);
        }
    }

    fn mark_disconnected(&self, st: &mut ScanState, role: ChannelRole) {
        let previous = st.connections.set(role, ChannelStatus::NotConnected);
        if let ChannelRole::PositionerDrive(i) | ChannelRole::PositionerReadback(i) = role {
            if let Some(fresh) = st.fresh.get_mut(i) {
                *fresh = false;
            }
        }
        if previous.is_ok() {
            tracing::warn!(scan = %self.name, %role, channel = %self.channel_name(role), "channel disconnected");
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn channel_name(&self, role: ChannelRole) -> String {
        self.channels
            .handle(role)
            .map(|ch| ch.name().to_string())
            .unwrap_or_else(|| role.to_string())
    }

    fn diagnostic(&self, st: &mut ScanState, err: ScanError) {
        tracing::warn!(scan = %self.name, phase = %st.phase, point = st.cpt, "{}", err);
        st.alert = true;
        st.message = err.to_string();
    }

    fn limits(&self) -> Vec<Limits> {
        self.config
            .positioners
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let range = self
                    .channels
                    .handle(ChannelRole::PositionerDrive(i))
                    .and_then(|ch| ch.metadata())
                    .and_then(|m| m.control_range);
                Limits::effective(p.low_limit, p.high_limit, range)
            })
            .collect()
    }

    fn read_priors_lenient(&self) -> Vec<f64> {
        (0..self.config.positioners.len())
            .map(|i| {
                self.channels
                    .handle(ChannelRole::PositionerDrive(i))
                    .and_then(|ch| ch.get().ok())
                    .unwrap_or(0.0)
            })
            .collect()
    }

    fn notify_outcome(&self, st: &ScanState) {
        let outcome = ScanOutcome {
            scan: self.name.clone(),
            points: st.cpt,
            aborted: st.aborted,
            message: st.message.clone(),
            generation: self.reader.snapshot().generation(),
        };
        let _ = self.outcomes.send(outcome);
    }

    fn publish(&self, st: &ScanState) {
        let previous = self.status.get().phase;
        if previous != st.phase {
            tracing::debug!(scan = %self.name, from = %previous, to = %st.phase, point = st.cpt, "phase");
        }
        self.status.set(st.snapshot(&self.name));
    }
}

impl ScanState {
    /// Whether losing `role` ends the running pass.
    fn loss_ends_pass(&self, role: ChannelRole) -> bool {
        match role {
            ChannelRole::PositionerDrive(i) | ChannelRole::PositionerReadback(i) => {
                self.valid_positioners.get(i).copied().unwrap_or(false)
            }
            ChannelRole::Trigger(i) => self.valid_triggers.get(i).copied().unwrap_or(false),
            ChannelRole::Detector(_) => false,
            ChannelRole::BeforeHook | ChannelRole::AfterHook => true,
        }
    }
}

impl ConnectionListener for ScanCore {
    fn connection_changed(
        &self,
        role: ChannelRole,
        status: ChannelStatus,
        _metadata: Option<ChannelMetadata>,
    ) {
        let mut st = self.state.lock();
        let previous = if status.is_ok() {
            st.connections.set(role, status)
        } else {
            let previous = st.connections.get(role);
            self.mark_disconnected(&mut st, role);
            previous
        };
        if previous == status {
            return;
        }
        tracing::debug!(scan = %self.name, %role, ?status, "connection changed");

        if st.busy && !status.is_ok() {
            if let ChannelRole::Detector(d) = role {
                if st.valid_detectors.get(d).copied().unwrap_or(false) {
                    st.degraded = true;
                }
            }
        }
        if st.phase == Phase::ScanPending && self.ready_to_start(&st) {
            self.process(&mut st);
        }
        self.publish(&st);
    }

    fn positioner_updated(&self, slot: usize, _value: f64) {
        let mut st = self.state.lock();
        let newly_fresh = match st.fresh.get_mut(slot) {
            Some(fresh) if !*fresh => {
                *fresh = true;
                true
            }
            _ => false,
        };
        if newly_fresh && st.phase == Phase::ScanPending && self.ready_to_start(&st) {
            self.process(&mut st);
            self.publish(&st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::MoveMotors.to_string(), "MoveMotors");
        assert_eq!(Phase::default(), Phase::Idle);
    }

    #[test]
    fn test_command_nudges_repeat() {
        let npos = 1;
        let mut st = ScanState {
            phase: Phase::Idle,
            execute: false,
            running: false,
            busy: false,
            paused: false,
            alert: false,
            message: String::new(),
            degraded: false,
            aborted: false,
            packed: true,
            cpt: 0,
            trajectory: Trajectory::new(2, 10),
            connections: ChannelSet::default().table(),
            fresh: vec![false; npos],
            valid_positioners: vec![true; npos],
            valid_detectors: Vec::new(),
            valid_triggers: Vec::new(),
            prior: vec![0.0; npos],
            desired: vec![0.0; npos],
            commanded: vec![f64::NAN; npos],
            retrace_targets: vec![0.0; npos],
            mark: None,
            search_message: None,
            on_the_fly: false,
            flying: false,
            clients_pending: 0,
            waiting_for_clients: false,
            barrier: CompletionBarrier::new(),
            settle: DelayTimer::new(),
            settle_wake: None,
            resume_wake: None,
            deadline: DelayTimer::new(),
            buffers: BufferSet::new(npos, 0, 10),
            started: None,
        };
        assert_eq!(st.command(0, 2.0), 2.0);
        let nudged = st.command(0, 2.0);
        assert!(nudged != 2.0 && (nudged - 2.0).abs() < 1e-12);
        assert_eq!(st.command(0, 4.0), 4.0);
    }
}
