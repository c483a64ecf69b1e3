//! Linear parameter resolver.
//!
//! Each positioner describes a linear trajectory with five coupled fields:
//!
//! ```text
//! end    = start + increment * (points - 1)
//! center = (start + end) / 2
//! width  = end - start
//! ```
//!
//! Writing one field leaves the set inconsistent. [`LinearParams::resolve`]
//! picks the remaining fields to recompute from a fixed precedence table,
//! honouring per-field [`FreezeFlags`] and the scan-level "points frozen" flag.
//! The table prefers keeping the increment and point count stable, then end
//! and center, then start. When every candidate rule touches a frozen field
//! the write is rejected as too constrained and nothing changes.
//!
//! A point-count change applies to every positioner of the scan at once;
//! [`Trajectory`] owns the positioners and propagates it. Positioners in
//! table mode ignore linear fields and get a table-length check instead.

use daq_core::error::{ScanError, ScanResult};
use daq_core::limits::{clamp_points, INCREMENT_EPSILON};
use serde::{Deserialize, Serialize};

// =============================================================================
// Field identifiers
// =============================================================================

/// One of the five mutually dependent linear fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearField {
    /// First point.
    Start,
    /// Step between points.
    Increment,
    /// Last point.
    End,
    /// Midpoint of start and end.
    Center,
    /// `end - start`.
    Width,
}

impl std::fmt::Display for LinearField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LinearField::Start => "start",
            LinearField::Increment => "increment",
            LinearField::End => "end",
            LinearField::Center => "center",
            LinearField::Width => "width",
        };
        write!(f, "{}", label)
    }
}

/// Per-field "do not recompute" flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeFlags {
    /// Keep start fixed.
    pub start: bool,
    /// Keep increment fixed.
    pub increment: bool,
    /// Keep end fixed.
    pub end: bool,
    /// Keep center fixed.
    pub center: bool,
    /// Keep width fixed.
    pub width: bool,
}

impl FreezeFlags {
    /// Whether `field` is frozen.
    pub fn is_frozen(&self, field: LinearField) -> bool {
        match field {
            LinearField::Start => self.start,
            LinearField::Increment => self.increment,
            LinearField::End => self.end,
            LinearField::Center => self.center,
            LinearField::Width => self.width,
        }
    }

    /// Freeze or release `field`.
    pub fn set(&mut self, field: LinearField, frozen: bool) {
        match field {
            LinearField::Start => self.start = frozen,
            LinearField::Increment => self.increment = frozen,
            LinearField::End => self.end = frozen,
            LinearField::Center => self.center = frozen,
            LinearField::Width => self.width = frozen,
        }
    }

    /// Five-bit freeze code, start in the high bit and width in the low bit.
    pub fn state_code(&self) -> u8 {
        (u8::from(self.start) << 4)
            | (u8::from(self.increment) << 3)
            | (u8::from(self.end) << 2)
            | (u8::from(self.center) << 1)
            | u8::from(self.width)
    }

    /// All five fields frozen.
    pub fn all() -> Self {
        Self {
            start: true,
            increment: true,
            end: true,
            center: true,
            width: true,
        }
    }
}

/// How a positioner's per-point targets are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// `start + point * increment`.
    #[default]
    Linear,
    /// Lookup in a pre-loaded table.
    Table,
    /// One continuous move from start to end while detectors are read.
    OnTheFly,
}

// =============================================================================
// Resolution
// =============================================================================

/// Point-count context for a single-field write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointCount {
    /// Current number of points.
    pub npts: usize,
    /// Buffer capacity; the count is clamped to it.
    pub capacity: usize,
    /// The scan forbids changing the point count.
    pub frozen: bool,
}

/// Outcome of a resolver call.
#[derive(Debug)]
pub enum Resolution {
    /// Fields were recomputed. `points` is `Some` when the point count changed.
    Adjusted {
        /// New point count, if it changed.
        points: Option<usize>,
    },
    /// The derived point count exceeded capacity and was clamped; the written
    /// field was adjusted to keep the set consistent.
    Clamped {
        /// The clamped point count.
        points: usize,
        /// Capacity diagnostic.
        diagnostic: ScanError,
    },
    /// No free field could absorb the change; nothing was modified.
    TooConstrained(ScanError),
    /// The positioner follows a table; linear fields were not touched.
    TableMode(ScanError),
}

impl Resolution {
    /// New point count, when the resolution changed it.
    pub fn new_points(&self) -> Option<usize> {
        match self {
            Resolution::Adjusted { points } => *points,
            Resolution::Clamped { points, .. } => Some(*points),
            _ => None,
        }
    }

    /// Diagnostic to surface, if any.
    pub fn diagnostic(&self) -> Option<&ScanError> {
        match self {
            Resolution::Adjusted { .. } => None,
            Resolution::Clamped { diagnostic, .. } => Some(diagnostic),
            Resolution::TooConstrained(err) | Resolution::TableMode(err) => Some(err),
        }
    }

    /// Consume into the diagnostic, if any.
    pub fn into_diagnostic(self) -> Option<ScanError> {
        match self {
            Resolution::Adjusted { .. } => None,
            Resolution::Clamped { diagnostic, .. } => Some(diagnostic),
            Resolution::TooConstrained(err) | Resolution::TableMode(err) => Some(err),
        }
    }
}

/// Number of points that cover `span` in steps of `increment`, clamped to
/// `capacity`. A zero increment asks for the full capacity.
fn points_for(span: f64, increment: f64, capacity: usize) -> (usize, Option<ScanError>) {
    let requested = if increment.abs() <= INCREMENT_EPSILON {
        capacity
    } else {
        let steps = (span / increment).round();
        if steps.is_finite() && steps >= 0.0 {
            // Saturating float-to-int cast; anything past capacity is clamped below.
            (steps as usize).saturating_add(1)
        } else {
            1
        }
    };
    clamp_points(requested, capacity)
}

fn spans(npts: usize) -> f64 {
    npts.saturating_sub(1).max(1) as f64
}

// =============================================================================
// LinearParams
// =============================================================================

/// The five linear fields of one positioner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    /// First point.
    pub start: f64,
    /// Step between points.
    pub increment: f64,
    /// Last point.
    pub end: f64,
    /// Midpoint.
    pub center: f64,
    /// `end - start`.
    pub width: f64,
}

impl LinearParams {
    /// Build a consistent set from start, increment and point count.
    pub fn from_start_increment(start: f64, increment: f64, npts: usize) -> Self {
        let end = start + increment * spans(npts);
        Self {
            start,
            increment,
            end,
            center: (start + end) / 2.0,
            width: end - start,
        }
    }

    /// Build a consistent set from start, end and point count.
    pub fn from_start_end(start: f64, end: f64, npts: usize) -> Self {
        Self {
            start,
            increment: (end - start) / spans(npts),
            end,
            center: (start + end) / 2.0,
            width: end - start,
        }
    }

    /// Value of `field`.
    pub fn get(&self, field: LinearField) -> f64 {
        match field {
            LinearField::Start => self.start,
            LinearField::Increment => self.increment,
            LinearField::End => self.end,
            LinearField::Center => self.center,
            LinearField::Width => self.width,
        }
    }

    fn put(&mut self, field: LinearField, value: f64) {
        match field {
            LinearField::Start => self.start = value,
            LinearField::Increment => self.increment = value,
            LinearField::End => self.end = value,
            LinearField::Center => self.center = value,
            LinearField::Width => self.width = value,
        }
    }

    /// Position of point `point` on this trajectory.
    pub fn position(&self, point: usize) -> f64 {
        self.start + self.increment * point as f64
    }

    /// Write `value` into `field` and recompute the dependent fields.
    ///
    /// On [`Resolution::TooConstrained`] the parameters are left exactly as
    /// they were before the call.
    pub fn resolve(
        &mut self,
        positioner: usize,
        field: LinearField,
        value: f64,
        freeze: &FreezeFlags,
        count: PointCount,
    ) -> Resolution {
        let saved = *self;
        self.put(field, value);

        let PointCount {
            npts,
            capacity,
            frozen: fp,
        } = count;
        let n1 = spans(npts);
        let FreezeFlags {
            start: fs,
            increment: fi,
            end: fe,
            center: fc,
            width: fw,
        } = *freeze;

        // Point-count rules report back through this.
        let recount = |span: f64, inc: f64| points_for(span, inc, capacity);
        let mut points = None;
        let mut clamp = None;

        let resolved = match field {
            LinearField::Start => {
                if !fi && !fc && !fw {
                    self.increment = (self.end - self.start) / n1;
                    self.derive_center_width();
                    true
                } else if !fp && !fc && !fw {
                    let (n, diag) = recount(self.end - self.start, self.increment);
                    if diag.is_some() {
                        self.start = self.end - self.increment * (n - 1) as f64;
                    }
                    self.derive_center_width();
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fe && !fc {
                    self.end = self.start + n1 * self.increment;
                    self.center = (self.start + self.end) / 2.0;
                    true
                } else if !fi && !fe && !fw {
                    self.width = (self.center - self.start) * 2.0;
                    self.increment = self.width / n1;
                    self.end = self.start + self.width;
                    true
                } else if !fp && !fe && !fw {
                    let (n, diag) = recount((self.center - self.start) * 2.0, self.increment);
                    if diag.is_some() {
                        self.start = self.center - self.increment * (n - 1) as f64 / 2.0;
                    }
                    self.end = 2.0 * self.center - self.start;
                    self.width = self.end - self.start;
                    points = Some(n);
                    clamp = diag;
                    true
                } else {
                    false
                }
            }
            LinearField::Increment => {
                if !fp {
                    let (n, diag) = recount(self.end - self.start, self.increment);
                    if diag.is_some() {
                        self.increment = (self.end - self.start) / spans(n);
                    }
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fe && !fc && !fw {
                    self.end = self.start + n1 * self.increment;
                    self.derive_center_width();
                    true
                } else if !fs && !fc && !fw {
                    self.start = self.end - n1 * self.increment;
                    self.derive_center_width();
                    true
                } else if !fs && !fe && !fw {
                    self.start = self.center - n1 * self.increment / 2.0;
                    self.end = self.center + n1 * self.increment / 2.0;
                    self.width = self.end - self.start;
                    true
                } else {
                    false
                }
            }
            LinearField::End => {
                if !fi && !fc && !fw {
                    self.increment = (self.end - self.start) / n1;
                    self.derive_center_width();
                    true
                } else if !fp && !fc && !fw {
                    let (n, diag) = recount(self.end - self.start, self.increment);
                    if diag.is_some() {
                        self.end = self.start + self.increment * (n - 1) as f64;
                    }
                    self.derive_center_width();
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fs && !fc {
                    self.start = self.end - n1 * self.increment;
                    self.center = (self.start + self.end) / 2.0;
                    true
                } else if !fs && !fw && !fi {
                    self.width = (self.end - self.center) * 2.0;
                    self.start = self.end - self.width;
                    self.increment = self.width / n1;
                    true
                } else if !fp && !fs && !fw {
                    let (n, diag) = recount((self.end - self.center) * 2.0, self.increment);
                    if diag.is_some() {
                        self.end = self.center + self.increment * (n - 1) as f64 / 2.0;
                    }
                    self.start = 2.0 * self.center - self.end;
                    self.width = self.end - self.start;
                    points = Some(n);
                    clamp = diag;
                    true
                } else {
                    false
                }
            }
            LinearField::Center => {
                if !fs && !fe {
                    self.start = self.center - n1 * self.increment / 2.0;
                    self.end = self.start + n1 * self.increment;
                    true
                } else if !fe && !fi && !fw {
                    self.width = (self.center - self.start) * 2.0;
                    self.end = self.start + self.width;
                    self.increment = self.width / n1;
                    true
                } else if !fs && !fi && !fw {
                    self.width = (self.end - self.center) * 2.0;
                    self.start = self.end - self.width;
                    self.increment = self.width / n1;
                    true
                } else if !fp && !fe && !fw {
                    let (n, diag) = recount((self.center - self.start) * 2.0, self.increment);
                    if diag.is_some() {
                        self.center = self.start + self.increment * (n - 1) as f64 / 2.0;
                    }
                    self.end = 2.0 * self.center - self.start;
                    self.width = self.end - self.start;
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fp && !fs && !fw {
                    let (n, diag) = recount((self.end - self.center) * 2.0, self.increment);
                    if diag.is_some() {
                        self.center = self.end - self.increment * (n - 1) as f64 / 2.0;
                    }
                    self.start = 2.0 * self.center - self.end;
                    self.width = self.end - self.start;
                    points = Some(n);
                    clamp = diag;
                    true
                } else {
                    false
                }
            }
            LinearField::Width => {
                if !fs && !fi && !fe {
                    self.increment = self.width / n1;
                    self.start = self.center - self.width / 2.0;
                    self.end = self.center + self.width / 2.0;
                    true
                } else if !fp && !fs && !fe {
                    let (n, diag) = recount(self.width, self.increment);
                    if diag.is_some() {
                        self.width = self.increment * (n - 1) as f64;
                    }
                    self.start = self.center - self.width / 2.0;
                    self.end = self.center + self.width / 2.0;
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fc && !fe && !fi {
                    self.increment = self.width / n1;
                    self.end = self.start + self.width;
                    self.center = self.start + self.width / 2.0;
                    true
                } else if !fs && !fc && !fi {
                    self.increment = self.width / n1;
                    self.start = self.end - self.width;
                    self.center = self.end - self.width / 2.0;
                    true
                } else if !fp && !fc && !fe {
                    let (n, diag) = recount(self.width, self.increment);
                    if diag.is_some() {
                        self.width = self.increment * (n - 1) as f64;
                    }
                    self.end = self.start + self.width;
                    self.center = self.start + self.width / 2.0;
                    points = Some(n);
                    clamp = diag;
                    true
                } else if !fp && !fs && !fc {
                    let (n, diag) = recount(self.width, self.increment);
                    if diag.is_some() {
                        self.width = self.increment * (n - 1) as f64;
                    }
                    self.start = self.end - self.width;
                    self.center = self.end - self.width / 2.0;
                    points = Some(n);
                    clamp = diag;
                    true
                } else {
                    false
                }
            }
        };

        if !resolved {
            *self = saved;
            return Resolution::TooConstrained(ScanError::TooConstrained { positioner });
        }

        match (points, clamp) {
            (Some(points), Some(diagnostic)) => Resolution::Clamped { points, diagnostic },
            (Some(n), None) if n != npts => Resolution::Adjusted { points: Some(n) },
            _ => Resolution::Adjusted { points: None },
        }
    }

    /// Recompute this positioner after the scan's point count changed to `npts`.
    ///
    /// The rule is chosen from the freeze code: a free increment absorbs the
    /// change; otherwise end, start, or both around the center move.
    pub fn resolve_points(
        &mut self,
        positioner: usize,
        freeze: &FreezeFlags,
        npts: usize,
    ) -> Resolution {
        let n1 = spans(npts);
        let code = freeze.state_code();

        if !freeze.increment {
            self.increment = (self.end - self.start) / n1;
            return Resolution::Adjusted { points: None };
        }
        match code {
            8 | 24 => {
                self.end = self.start + n1 * self.increment;
                self.derive_center_width();
            }
            12 => {
                self.start = self.end - n1 * self.increment;
                self.derive_center_width();
            }
            10 => {
                self.start = self.center - n1 * self.increment / 2.0;
                self.end = self.center + n1 * self.increment / 2.0;
                self.width = self.end - self.start;
            }
            _ => return Resolution::TooConstrained(ScanError::TooConstrained { positioner }),
        }
        Resolution::Adjusted { points: None }
    }

    fn derive_center_width(&mut self) {
        self.center = (self.start + self.end) / 2.0;
        self.width = self.end - self.start;
    }
}

// =============================================================================
// Trajectory
// =============================================================================

/// One positioner's trajectory description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Axis {
    /// Linear fields.
    pub params: LinearParams,
    /// Per-field freeze flags.
    pub freeze: FreezeFlags,
    /// Step mode.
    pub mode: StepMode,
    /// Positions are offsets from the position read at scan start.
    pub relative: bool,
    /// Table of targets (table mode only).
    pub table: Vec<f64>,
    saved_freeze: Option<FreezeFlags>,
    saved_linear: Option<LinearParams>,
}

impl Axis {
    /// Axis with the given linear parameters.
    pub fn linear(params: LinearParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Axis following `table`.
    pub fn table(table: Vec<f64>) -> Self {
        Self {
            mode: StepMode::Table,
            table,
            ..Default::default()
        }
    }
}

/// Result of a trajectory edit.
#[derive(Debug, Default)]
pub struct Adjustment {
    /// The scan's point count changed.
    pub points_changed: bool,
    /// Diagnostics to surface, in the order they were produced.
    pub diagnostics: Vec<ScanError>,
}

impl Adjustment {
    /// Whether any diagnostic was produced.
    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Every positioner's trajectory plus the scan-level point count.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    axes: Vec<Axis>,
    npts: usize,
    capacity: usize,
    points_frozen: bool,
}

impl Trajectory {
    /// Empty trajectory with `npts` points, clamped to `capacity`.
    pub fn new(npts: usize, capacity: usize) -> Self {
        let (npts, _) = clamp_points(npts, capacity);
        Self {
            axes: Vec::new(),
            npts,
            capacity,
            points_frozen: false,
        }
    }

    /// Add a positioner; returns its slot index.
    pub fn push(&mut self, axis: Axis) -> usize {
        self.axes.push(axis);
        self.axes.len() - 1
    }

    /// Number of points.
    pub fn npts(&self) -> usize {
        self.npts
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Positioner slots.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// One positioner slot.
    pub fn axis(&self, positioner: usize) -> ScanResult<&Axis> {
        self.axes.get(positioner).ok_or(ScanError::InvalidSlot {
            kind: "positioner",
            index: positioner,
        })
    }

    fn axis_mut(&mut self, positioner: usize) -> ScanResult<&mut Axis> {
        self.axes.get_mut(positioner).ok_or(ScanError::InvalidSlot {
            kind: "positioner",
            index: positioner,
        })
    }

    /// Whether any positioner moves continuously.
    pub fn is_on_the_fly(&self) -> bool {
        self.axes.iter().any(|a| a.mode == StepMode::OnTheFly)
    }

    /// Forbid or allow point-count changes from field writes.
    pub fn set_points_frozen(&mut self, frozen: bool) {
        self.points_frozen = frozen;
    }

    /// Whether point-count changes are forbidden.
    pub fn points_frozen(&self) -> bool {
        self.points_frozen
    }

    /// Write one linear field of one positioner and propagate the result.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown positioner. Resolver
    /// diagnostics are returned inside the [`Adjustment`].
    pub fn set_field(
        &mut self,
        positioner: usize,
        field: LinearField,
        value: f64,
    ) -> ScanResult<Adjustment> {
        let count = PointCount {
            npts: self.npts,
            capacity: self.capacity,
            frozen: self.points_frozen,
        };
        let axis = self.axis_mut(positioner)?;
        let mut adjustment = Adjustment::default();

        let resolution = if axis.mode == StepMode::Table {
            Resolution::TableMode(ScanError::TableMode { positioner })
        } else {
            let freeze = axis.freeze;
            axis.params.resolve(positioner, field, value, &freeze, count)
        };
        let new_points = resolution.new_points();
        if let Some(diag) = resolution.into_diagnostic() {
            adjustment.diagnostics.push(diag);
        }
        if let Some(n) = new_points {
            if n != self.npts {
                self.npts = n;
                adjustment.points_changed = true;
                self.propagate_points(Some(positioner), &mut adjustment.diagnostics);
            }
        }
        Ok(adjustment)
    }

    /// Set the scan's point count and recompute every positioner.
    pub fn set_points(&mut self, npts: usize) -> Adjustment {
        let (npts, clamp) = clamp_points(npts, self.capacity);
        let mut adjustment = Adjustment {
            points_changed: npts != self.npts,
            diagnostics: clamp.into_iter().collect(),
        };
        self.npts = npts;
        self.propagate_points(None, &mut adjustment.diagnostics);
        adjustment
    }

    fn propagate_points(&mut self, skip: Option<usize>, diagnostics: &mut Vec<ScanError>) {
        let npts = self.npts;
        for (index, axis) in self.axes.iter_mut().enumerate() {
            if Some(index) == skip {
                continue;
            }
            match axis.mode {
                StepMode::Table => {
                    if let Some(diag) = table_underrun(index, axis, npts) {
                        diagnostics.push(diag);
                    }
                }
                StepMode::Linear | StepMode::OnTheFly => {
                    let freeze = axis.freeze;
                    if let Some(diag) = axis
                        .params
                        .resolve_points(index, &freeze, npts)
                        .into_diagnostic()
                    {
                        diagnostics.push(diag);
                    }
                }
            }
        }
    }

    /// Freeze or release one field of one positioner.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn set_freeze(
        &mut self,
        positioner: usize,
        field: LinearField,
        frozen: bool,
    ) -> ScanResult<()> {
        self.axis_mut(positioner)?.freeze.set(field, frozen);
        Ok(())
    }

    /// Temporarily release every freeze flag (`true`), or put the saved flags
    /// back (`false`).
    pub fn set_freeze_override(&mut self, active: bool) {
        for axis in &mut self.axes {
            if active {
                if axis.saved_freeze.is_none() {
                    axis.saved_freeze = Some(axis.freeze);
                }
                axis.freeze = FreezeFlags::default();
            } else if let Some(saved) = axis.saved_freeze.take() {
                axis.freeze = saved;
            }
        }
    }

    /// Change a positioner's step mode.
    ///
    /// Entering table mode stashes and zeroes the linear fields; leaving it
    /// restores them and re-resolves the positioner against the current point
    /// count.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn set_step_mode(&mut self, positioner: usize, mode: StepMode) -> ScanResult<Adjustment> {
        let npts = self.npts;
        let axis = self.axis_mut(positioner)?;
        let mut adjustment = Adjustment::default();
        let previous = axis.mode;
        axis.mode = mode;

        match (previous, mode) {
            (StepMode::Table, StepMode::Table) => {}
            (_, StepMode::Table) => {
                axis.saved_linear = Some(axis.params);
                axis.params = LinearParams::default();
                if let Some(diag) = table_underrun(positioner, axis, npts) {
                    adjustment.diagnostics.push(diag);
                }
            }
            (StepMode::Table, _) => {
                if let Some(saved) = axis.saved_linear.take() {
                    axis.params = saved;
                }
                let freeze = axis.freeze;
                if let Some(diag) = axis
                    .params
                    .resolve_points(positioner, &freeze, npts)
                    .into_diagnostic()
                {
                    adjustment.diagnostics.push(diag);
                }
            }
            _ => {}
        }
        Ok(adjustment)
    }

    /// Replace a positioner's table. Returns the underrun diagnostic if the
    /// table is shorter than the point count.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown positioner.
    pub fn load_table(&mut self, positioner: usize, table: Vec<f64>) -> ScanResult<Option<ScanError>> {
        let npts = self.npts;
        let axis = self.axis_mut(positioner)?;
        axis.table = table;
        Ok(if axis.mode == StepMode::Table {
            table_underrun(positioner, axis, npts)
        } else {
            None
        })
    }

    /// Underrun diagnostics for every table-mode positioner.
    pub fn check_tables(&self) -> Vec<ScanError> {
        self.axes
            .iter()
            .enumerate()
            .filter(|(_, axis)| axis.mode == StepMode::Table)
            .filter_map(|(index, axis)| table_underrun(index, axis, self.npts))
            .collect()
    }

    /// Target of `positioner` at `point`. `prior` is the position read at scan
    /// start and is added for relative positioners.
    ///
    /// A table shorter than the scan replays its last value.
    pub fn target(&self, positioner: usize, point: usize, prior: f64) -> ScanResult<f64> {
        let axis = self.axis(positioner)?;
        let base = match axis.mode {
            StepMode::Table => axis
                .table
                .get(point)
                .or_else(|| axis.table.last())
                .copied()
                .unwrap_or(0.0),
            StepMode::Linear | StepMode::OnTheFly => axis.params.position(point),
        };
        Ok(if axis.relative { base + prior } else { base })
    }

    /// Where an on-the-fly positioner is sent for its continuous move.
    pub fn fly_end(&self, positioner: usize, prior: f64) -> ScanResult<f64> {
        let axis = self.axis(positioner)?;
        let end = axis.params.end;
        Ok(if axis.relative { end + prior } else { end })
    }

    /// Planned positions of every positioner at every point.
    ///
    /// `priors[i]` is positioner `i`'s position at scan start; missing
    /// entries count as zero.
    pub fn planned(&self, priors: &[f64]) -> Vec<Vec<f64>> {
        (0..self.axes.len())
            .map(|index| {
                let prior = priors.get(index).copied().unwrap_or(0.0);
                (0..self.npts)
                    .map(|point| self.target(index, point, prior).unwrap_or(0.0))
                    .collect()
            })
            .collect()
    }
}

fn table_underrun(positioner: usize, axis: &Axis, npts: usize) -> Option<ScanError> {
    (axis.table.len() < npts).then_some(ScanError::TableUnderrun {
        positioner,
        loaded: axis.table.len(),
        requested: npts,
    })
}
