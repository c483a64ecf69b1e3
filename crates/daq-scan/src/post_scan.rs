//! Post-scan processing: retrace policy and peak/valley/edge search.
//!
//! After a pass finishes, the reference detector's acquired data is searched
//! for a mark point. A mark is accepted only when the spread between the
//! highest and lowest sample is at least twice the mean point-to-point
//! difference, which rejects flat or noise-dominated data. Edge policies search
//! the symmetric-difference slope of the data against the first positioner's
//! readback instead of the data itself.

use daq_core::limits::SLOPE_DENOMINATOR_FLOOR;
use serde::{Deserialize, Serialize};

/// Where positioners go after a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetracePolicy {
    /// Stay at the last point.
    #[default]
    Stay,
    /// Return to the first point.
    Start,
    /// Return to the position read before the pass.
    Prior,
    /// Go to the reference detector's maximum.
    Peak,
    /// Go to the reference detector's minimum.
    Valley,
    /// Go to the steepest rising slope.
    RisingEdge,
    /// Go to the steepest falling slope.
    FallingEdge,
}

impl RetracePolicy {
    /// Whether this policy needs a mark search.
    pub fn searches(&self) -> bool {
        matches!(
            self,
            RetracePolicy::Peak
                | RetracePolicy::Valley
                | RetracePolicy::RisingEdge
                | RetracePolicy::FallingEdge
        )
    }

    /// Whether positioners move at all.
    pub fn moves(&self) -> bool {
        !matches!(self, RetracePolicy::Stay)
    }
}

impl std::fmt::Display for RetracePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RetracePolicy::Stay => "STAY",
            RetracePolicy::Start => "START POS",
            RetracePolicy::Prior => "PRIOR POS",
            RetracePolicy::Peak => "PEAK POS",
            RetracePolicy::Valley => "VALLEY POS",
            RetracePolicy::RisingEdge => "+EDGE POS",
            RetracePolicy::FallingEdge => "-EDGE POS",
        };
        write!(f, "{}", label)
    }
}

/// Result of a mark search.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSearch {
    /// Index of the accepted mark, if any.
    pub mark: Option<usize>,
    /// Status text (`"PEAK POS found."`, `"VALLEY POS NOT found."`).
    pub message: String,
}

impl PeakSearch {
    /// Whether a mark was found.
    pub fn found(&self) -> bool {
        self.mark.is_some()
    }
}

/// Three-point (1/4, 1/2, 1/4) smoothing, endpoints unchanged.
fn smooth(data: &mut [f64], passes: u32) {
    if data.len() < 3 {
        return;
    }
    let mut scratch = data.to_vec();
    for _ in 0..passes {
        for i in 1..data.len() - 1 {
            scratch[i] = data[i - 1] / 4.0 + data[i] / 2.0 + data[i + 1] / 4.0;
        }
        data.copy_from_slice(&scratch);
    }
}

/// Symmetric-difference slope of `data` against `positions`.
///
/// Position differences smaller than the floor are widened to it (keeping
/// their sign) so a stalled positioner does not produce an infinite slope.
/// Endpoints copy their neighbours.
fn slope(data: &[f64], positions: &[f64]) -> Vec<f64> {
    let n = data.len().min(positions.len());
    let mut out = data[..n].to_vec();
    if n < 3 {
        return out;
    }
    for i in 1..n - 1 {
        let mut d = positions[i + 1] - positions[i - 1];
        if d.abs() < SLOPE_DENOMINATOR_FLOOR {
            d = if d < 0.0 {
                -SLOPE_DENOMINATOR_FLOOR
            } else {
                SLOPE_DENOMINATOR_FLOOR
            };
        }
        out[i] = (data[i + 1] - data[i - 1]) / d;
    }
    out[n - 1] = out[n - 2];
    out[0] = out[1];
    out
}

/// Index of the mark point for `policy`, or `None` if the data has no
/// acceptable extremum or the policy does not search.
///
/// `data` and `positions` are the acquired prefixes of the reference detector
/// and the first positioner's readback.
pub fn find_mark(
    data: &[f64],
    positions: &[f64],
    policy: RetracePolicy,
    smoothing: u32,
) -> Option<usize> {
    if !policy.searches() || data.len() < 2 {
        return None;
    }

    let mut samples = data.to_vec();
    smooth(&mut samples, smoothing);
    if matches!(policy, RetracePolicy::RisingEdge | RetracePolicy::FallingEdge) {
        samples = slope(&samples, positions);
    }
    if samples.len() < 2 {
        return None;
    }

    let mut high = (0, f64::NEG_INFINITY);
    let mut low = (0, f64::INFINITY);
    for (i, value) in samples.iter().copied().enumerate() {
        if value > high.1 {
            high = (i, value);
        }
        if value < low.1 {
            low = (i, value);
        }
    }
    let ave_diff = samples
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .sum::<f64>()
        / (samples.len() - 1) as f64;

    let spread = high.1 - low.1;
    if spread > 0.0 && spread >= 2.0 * ave_diff {
        Some(match policy {
            RetracePolicy::Peak | RetracePolicy::RisingEdge => high.0,
            _ => low.0,
        })
    } else {
        None
    }
}

/// Run the mark search and build the status text.
pub fn peak_search(
    data: &[f64],
    positions: &[f64],
    policy: RetracePolicy,
    smoothing: u32,
) -> PeakSearch {
    let mark = find_mark(data, positions, policy, smoothing);
    let message = match mark {
        Some(_) => format!("{} found.", policy),
        None => format!("{} NOT found.", policy),
    };
    PeakSearch { mark, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITIONS: [f64; 5] = [0.0, 1.0, 2.0, 3.0, 4.0];

    #[test]
    fn test_peak_found() {
        let search = peak_search(&[1.0, 2.0, 5.0, 2.0, 1.0], &POSITIONS, RetracePolicy::Peak, 0);
        assert_eq!(search.mark, Some(2));
        assert_eq!(search.message, "PEAK POS found.");
    }

    #[test]
    fn test_valley_found() {
        let mark = find_mark(&[5.0, 4.0, 0.0, 4.0, 5.0], &POSITIONS, RetracePolicy::Valley, 0);
        assert_eq!(mark, Some(2));
    }

    #[test]
    fn test_flat_data_not_found() {
        let search = peak_search(&[3.0; 5], &POSITIONS, RetracePolicy::Peak, 0);
        assert!(!search.found());
        assert_eq!(search.message, "PEAK POS NOT found.");
    }

    #[test]
    fn test_noise_not_found() {
        // Alternating data: spread equals the mean step, well under twice it.
        let mark = find_mark(&[0.0, 1.0, 0.0, 1.0, 0.0], &POSITIONS, RetracePolicy::Peak, 0);
        assert_eq!(mark, None);
    }

    #[test]
    fn test_rising_edge() {
        let data = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let positions = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let mark = find_mark(&data, &positions, RetracePolicy::RisingEdge, 0);
        assert_eq!(mark, Some(2));
        let falling = [1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let mark = find_mark(&falling, &positions, RetracePolicy::FallingEdge, 0);
        assert_eq!(mark, Some(2));
    }

    #[test]
    fn test_smoothing_keeps_endpoints() {
        let mut data = [0.0, 4.0, 0.0, 4.0, 0.0];
        smooth(&mut data, 1);
        assert_eq!(data, [0.0, 2.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_stay_does_not_search() {
        assert_eq!(
            find_mark(&[1.0, 5.0, 1.0], &POSITIONS, RetracePolicy::Stay, 0),
            None
        );
        assert!(!RetracePolicy::Stay.moves());
        assert!(RetracePolicy::Prior.moves());
    }
}
