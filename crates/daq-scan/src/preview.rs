//! Limit check and trajectory preview.
//!
//! Both operate on a [`Trajectory`] plus the positions read at scan start and
//! never move anything. The limit check runs automatically when a scan
//! starts; a violation stops the scan before its first write.

use crate::linear::Trajectory;
use daq_core::error::{LimitSide, ScanError, ScanResult};
use serde::Serialize;

/// Operating range of one positioner. `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Limits {
    /// Low limit.
    pub low: Option<f64>,
    /// High limit.
    pub high: Option<f64>,
}

impl Limits {
    /// Override values win over the channel's control range.
    pub fn effective(
        low_override: Option<f64>,
        high_override: Option<f64>,
        control_range: Option<(f64, f64)>,
    ) -> Self {
        Self {
            low: low_override.or(control_range.map(|r| r.0)),
            high: high_override.or(control_range.map(|r| r.1)),
        }
    }

    fn check(&self, positioner: usize, point: usize, value: f64) -> ScanResult<()> {
        if let Some(low) = self.low {
            if value < low {
                return Err(ScanError::LimitViolation {
                    positioner,
                    point,
                    value,
                    limit: low,
                    side: LimitSide::Low,
                });
            }
        }
        if let Some(high) = self.high {
            if value > high {
                return Err(ScanError::LimitViolation {
                    positioner,
                    point,
                    value,
                    limit: high,
                    side: LimitSide::High,
                });
            }
        }
        Ok(())
    }
}

/// Planned positions, one row per positioner.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Preview {
    /// `positions[p][j]` is positioner `p` at point `j`.
    pub positions: Vec<Vec<f64>>,
}

/// Check every planned point of every participating positioner.
///
/// Positioners with `participating[p] == false` are skipped; missing entries
/// participate.
///
/// # Errors
///
/// The first `ScanError::LimitViolation`, scanning positioner by positioner.
pub fn check_limits(
    trajectory: &Trajectory,
    priors: &[f64],
    limits: &[Limits],
    participating: &[bool],
) -> ScanResult<()> {
    let planned = trajectory.planned(priors);
    for (positioner, row) in planned.iter().enumerate() {
        if !participating.get(positioner).copied().unwrap_or(true) {
            continue;
        }
        let Some(limits) = limits.get(positioner) else {
            continue;
        };
        for (point, value) in row.iter().copied().enumerate() {
            limits.check(positioner, point, value)?;
        }
    }
    Ok(())
}

/// Planned positions of every positioner.
pub fn preview(trajectory: &Trajectory, priors: &[f64]) -> Preview {
    Preview {
        positions: trajectory.planned(priors),
    }
}
