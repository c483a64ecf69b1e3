//! Double-buffered scan data.
//!
//! Every positioner readback and every detector owns a [`DoubleBuffer`]: a
//! filling array written point by point during a pass, and the valid array of
//! the last completed pass. [`BufferSet`] groups them and publishes all valid
//! arrays together as one immutable [`BufferView`]. Readers hold an
//! `Arc<BufferView>`, so their view stays pinned to one generation even while
//! the next pass finalizes.
//!
//! # Finalize
//!
//! 1. Pad `[points, capacity)` of every filling array with its last written
//!    value.
//! 2. Swap: the padded arrays become the valid ones; a new [`BufferView`] with
//!    the next generation number replaces the published one under a single
//!    write lock.
//!
//! Additive and accumulate modes add the previous valid value into each
//! detector point as it is recorded (see [`BufferSet::record_detector`]).

use daq_core::error::{ScanError, ScanResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;

/// How detector data is acquired and combined across passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// One value per point; each pass replaces the previous.
    #[default]
    PointByPoint,
    /// Add the previous pass's values once.
    Additive,
    /// Keep adding across consecutive accumulate passes.
    Accumulate,
    /// Array-valued detectors are read once per pass.
    BulkArray,
}

// =============================================================================
// Snapshot / BufferView
// =============================================================================

/// One array from a published pass.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    points: usize,
    data: Arc<[f64]>,
}

impl Snapshot {
    /// Generation of the pass this array belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Points actually acquired in that pass.
    pub fn points(&self) -> usize {
        self.points
    }

    /// The acquired prefix, without padding.
    pub fn acquired(&self) -> &[f64] {
        &self.data[..self.points.min(self.data.len())]
    }
}

impl Deref for Snapshot {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.data
    }
}

/// All valid arrays of one completed pass.
#[derive(Debug, Clone, Default)]
pub struct BufferView {
    generation: u64,
    points: usize,
    positioners: Vec<Arc<[f64]>>,
    detectors: Vec<Arc<[f64]>>,
}

impl BufferView {
    /// Pass generation; zero before the first pass completes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Points acquired in the pass.
    pub fn points(&self) -> usize {
        self.points
    }

    /// Positioner readback array.
    pub fn positioner(&self, slot: usize) -> Option<Snapshot> {
        self.positioners.get(slot).map(|data| self.snapshot(data))
    }

    /// Detector array.
    pub fn detector(&self, slot: usize) -> Option<Snapshot> {
        self.detectors.get(slot).map(|data| self.snapshot(data))
    }

    fn snapshot(&self, data: &Arc<[f64]>) -> Snapshot {
        Snapshot {
            generation: self.generation,
            points: self.points,
            data: data.clone(),
        }
    }
}

/// Cloneable read handle onto the published pass.
#[derive(Debug, Clone)]
pub struct BufferReader {
    published: Arc<RwLock<Arc<BufferView>>>,
}

impl BufferReader {
    /// Pin the current pass.
    pub fn snapshot(&self) -> Arc<BufferView> {
        self.published.read().clone()
    }
}

// =============================================================================
// DoubleBuffer
// =============================================================================

/// Filling and valid arrays for one slot.
#[derive(Debug)]
pub struct DoubleBuffer {
    filling: Vec<f64>,
    valid: Arc<[f64]>,
}

impl DoubleBuffer {
    /// Zeroed buffers of `capacity` points.
    pub fn new(capacity: usize) -> Self {
        Self {
            filling: vec![0.0; capacity],
            valid: Arc::from(vec![0.0; capacity]),
        }
    }

    /// Capacity in points.
    pub fn capacity(&self) -> usize {
        self.filling.len()
    }

    /// Write `value` at `point` of the filling array.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` when `point` is past the capacity.
    pub fn fill(&mut self, point: usize, value: f64) -> ScanResult<()> {
        let cell = self.filling.get_mut(point).ok_or(ScanError::InvalidSlot {
            kind: "point",
            index: point,
        })?;
        *cell = value;
        Ok(())
    }

    /// Copy `values` into the start of the filling array, truncated to capacity.
    pub fn fill_from(&mut self, values: &[f64]) -> usize {
        let n = values.len().min(self.filling.len());
        self.filling[..n].copy_from_slice(&values[..n]);
        n
    }

    /// Value at `point` of the filling array.
    pub fn filling(&self, point: usize) -> Option<f64> {
        self.filling.get(point).copied()
    }

    /// Value at `point` of the valid array.
    pub fn previous(&self, point: usize) -> Option<f64> {
        self.valid.get(point).copied()
    }

    /// Pad the tail, then make the filling array the valid one.
    pub fn finalize(&mut self, points: usize) -> Arc<[f64]> {
        let last = points
            .checked_sub(1)
            .and_then(|i| self.filling.get(i).copied())
            .unwrap_or(0.0);
        let from = points.min(self.filling.len());
        self.filling[from..].fill(last);
        self.valid = Arc::from(self.filling.as_slice());
        self.valid.clone()
    }

    /// The valid array.
    pub fn valid(&self) -> Arc<[f64]> {
        self.valid.clone()
    }
}

// =============================================================================
// BufferSet
// =============================================================================

/// Every positioner and detector buffer of one scan.
#[derive(Debug)]
pub struct BufferSet {
    capacity: usize,
    positioners: Vec<DoubleBuffer>,
    detectors: Vec<DoubleBuffer>,
    published: Arc<RwLock<Arc<BufferView>>>,
    generation: u64,
    prev_mode: AcquisitionMode,
    prev_points: usize,
}

impl BufferSet {
    /// Allocate buffers for `positioners` and `detectors` slots.
    pub fn new(positioners: usize, detectors: usize, capacity: usize) -> Self {
        let positioners: Vec<_> = (0..positioners).map(|_| DoubleBuffer::new(capacity)).collect();
        let detectors: Vec<_> = (0..detectors).map(|_| DoubleBuffer::new(capacity)).collect();
        let view = BufferView {
            generation: 0,
            points: 0,
            positioners: positioners.iter().map(DoubleBuffer::valid).collect(),
            detectors: detectors.iter().map(DoubleBuffer::valid).collect(),
        };
        Self {
            capacity,
            positioners,
            detectors,
            published: Arc::new(RwLock::new(Arc::new(view))),
            generation: 0,
            prev_mode: AcquisitionMode::PointByPoint,
            prev_points: 0,
        }
    }

    /// Capacity in points.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read handle for consumers.
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            published: self.published.clone(),
        }
    }

    /// Number of points the last completed pass acquired.
    pub fn prev_points(&self) -> usize {
        self.prev_points
    }

    /// Whether a detector value recorded at `point` under `mode` gets the
    /// previous pass's value added.
    pub fn accumulates(&self, mode: AcquisitionMode, point: usize) -> bool {
        let combine = match mode {
            AcquisitionMode::Additive => true,
            AcquisitionMode::Accumulate => self.prev_mode == AcquisitionMode::Accumulate,
            AcquisitionMode::PointByPoint | AcquisitionMode::BulkArray => false,
        };
        combine && point < self.prev_points
    }

    /// Record a positioner readback.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown slot or a point past capacity.
    pub fn record_positioner(&mut self, slot: usize, point: usize, value: f64) -> ScanResult<()> {
        self.positioners
            .get_mut(slot)
            .ok_or(ScanError::InvalidSlot {
                kind: "positioner",
                index: slot,
            })?
            .fill(point, value)
    }

    /// Record a detector value, adding the previous pass's value when `mode`
    /// accumulates. Returns the stored value.
    ///
    /// # Errors
    ///
    /// `ScanError::InvalidSlot` for an unknown slot or a point past capacity.
    pub fn record_detector(
        &mut self,
        slot: usize,
        point: usize,
        value: f64,
        mode: AcquisitionMode,
    ) -> ScanResult<f64> {
        let combine = self.accumulates(mode, point);
        let buffer = self.detectors.get_mut(slot).ok_or(ScanError::InvalidSlot {
            kind: "detector",
            index: slot,
        })?;
        let stored = if combine {
            value + buffer.previous(point).unwrap_or(0.0)
        } else {
            value
        };
        buffer.fill(point, stored)?;
        Ok(stored)
    }

    /// Copy a whole positioner array (bulk acquisition).
    pub fn record_positioner_array(&mut self, slot: usize, values: &[f64]) -> ScanResult<usize> {
        Ok(self
            .positioners
            .get_mut(slot)
            .ok_or(ScanError::InvalidSlot {
                kind: "positioner",
                index: slot,
            })?
            .fill_from(values))
    }

    /// Copy a whole detector array (bulk acquisition).
    pub fn record_detector_array(&mut self, slot: usize, values: &[f64]) -> ScanResult<usize> {
        Ok(self
            .detectors
            .get_mut(slot)
            .ok_or(ScanError::InvalidSlot {
                kind: "detector",
                index: slot,
            })?
            .fill_from(values))
    }

    /// Positioner value recorded at `point` during the current pass.
    pub fn positioner_value(&self, slot: usize, point: usize) -> Option<f64> {
        self.positioners.get(slot).and_then(|b| b.filling(point))
    }

    /// Detector value recorded at `point` during the current pass.
    pub fn detector_value(&self, slot: usize, point: usize) -> Option<f64> {
        self.detectors.get(slot).and_then(|b| b.filling(point))
    }

    /// Pad, swap and publish every buffer as one pass of `points` points.
    ///
    /// Finalizing again without recording anything new publishes identical
    /// contents.
    pub fn finalize(&mut self, points: usize, mode: AcquisitionMode) -> Arc<BufferView> {
        let points = points.min(self.capacity);
        self.generation += 1;
        let view = Arc::new(BufferView {
            generation: self.generation,
            points,
            positioners: self.positioners.iter_mut().map(|b| b.finalize(points)).collect(),
            detectors: self.detectors.iter_mut().map(|b| b.finalize(points)).collect(),
        });
        *self.published.write() = view.clone();
        self.prev_mode = mode;
        self.prev_points = points;
        tracing::trace!(generation = self.generation, points, "buffers published");
        view
    }
}
