//! Scan configuration.
//!
//! One [`ScanConfig`] describes one scan: its buffers, trajectory, detectors,
//! triggers, hooks and timing. A [`ScanSetConfig`] groups the scans of a
//! nested set; a trigger with `inner_scan = "<name>"` makes the named scan the
//! inner dimension of the scan that owns the trigger.
//!
//! ## Loading
//!
//! [`ScanSetConfig::load_from`] reads a TOML file through `figment` and
//! merges environment overrides prefixed with `SCAN_DAQ_` (nested keys split
//! on `__`), then runs [`ScanSetConfig::validate`].
//!
//! ```toml
//! [[scans]]
//! name = "outer"
//! points = 6
//! retrace = "prior"
//! positioner_settle = "50ms"
//!
//! [[scans.positioners]]
//! drive = "motor:x"
//! readback = "motor:x.rbv"
//! start = 0.0
//! end = 10.0
//!
//! [[scans.detectors]]
//! channel = "det:counts"
//!
//! [[scans.triggers]]
//! channel = "det:trigger"
//! value = 1.0
//! ```

use crate::buffer::AcquisitionMode;
use crate::linear::{Axis, FreezeFlags, LinearParams, StepMode, Trajectory};
use crate::post_scan::RetracePolicy;
use daq_core::error::{ScanError, ScanResult};
use daq_core::limits::{
    clamp_points, validate_capacity, DEFAULT_CAPACITY, MAX_DETECTORS, MAX_POSITIONERS,
    MAX_TRIGGERS,
};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_points() -> usize {
    10
}

fn default_trigger_value() -> f64 {
    1.0
}

/// One positioner slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// Drive (command) channel.
    pub drive: String,
    /// Readback channel; `"time"` records seconds since scan start.
    pub readback: Option<String>,
    /// Step mode.
    pub mode: StepMode,
    /// Positions are offsets from the position read at scan start.
    pub relative: bool,
    /// First point.
    pub start: f64,
    /// Step between points. Derived from `end` when absent.
    pub increment: Option<f64>,
    /// Last point. Ignored when `increment` is given.
    pub end: Option<f64>,
    /// Fields the resolver must not recompute.
    pub freeze: FreezeFlags,
    /// Targets for table mode.
    pub table: Vec<f64>,
    /// Low limit override; the drive's control range applies otherwise.
    pub low_limit: Option<f64>,
    /// High limit override.
    pub high_limit: Option<f64>,
    /// Readback tolerance. Positive: absolute distance. Negative: multiple
    /// of the increment. Zero: unchecked.
    pub readback_tolerance: f64,
}

impl PositionerConfig {
    fn linear_params(&self, npts: usize) -> LinearParams {
        match (self.increment, self.end) {
            (Some(increment), _) => LinearParams::from_start_increment(self.start, increment, npts),
            (None, Some(end)) => LinearParams::from_start_end(self.start, end, npts),
            (None, None) => LinearParams::from_start_end(self.start, self.start, npts),
        }
    }

    /// Trajectory axis described by this slot.
    pub fn axis(&self, npts: usize) -> Axis {
        let mut axis = Axis::linear(self.linear_params(npts));
        axis.freeze = self.freeze;
        axis.mode = self.mode;
        axis.relative = self.relative;
        axis.table = self.table.clone();
        axis
    }
}

/// One detector slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Detector channel.
    pub channel: String,
}

/// One trigger slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Trigger channel.
    pub channel: Option<String>,
    /// Name of a scan in the same set run as this trigger.
    pub inner_scan: Option<String>,
    /// Value written on trigger.
    pub value: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            channel: None,
            inner_scan: None,
            value: default_trigger_value(),
        }
    }
}

/// Before- or after-scan hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Hook channel.
    pub channel: String,
    /// Value written.
    pub value: f64,
    /// Wait for the write to complete before continuing.
    pub wait: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            value: 1.0,
            wait: false,
        }
    }
}

/// One scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Unique name within the set.
    pub name: String,
    /// Buffer capacity in points.
    pub max_points: usize,
    /// Points per pass.
    pub points: usize,
    /// Forbid field writes from changing the point count.
    pub freeze_points: bool,
    /// Detector acquisition mode.
    pub acquisition: AcquisitionMode,
    /// What positioners do after a pass.
    pub retrace: RetracePolicy,
    /// Detector searched by peak/valley/edge retrace.
    pub reference_detector: usize,
    /// Smoothing passes before the mark search.
    pub peak_smoothing_passes: u32,
    /// Delay after positioners settle, before triggering.
    #[serde(with = "humantime_serde")]
    pub positioner_settle: Duration,
    /// Delay after triggers complete, before reading.
    #[serde(with = "humantime_serde")]
    pub detector_settle: Duration,
    /// Delay before re-entry when a pause is released.
    #[serde(with = "humantime_serde")]
    pub resume_delay: Duration,
    /// Deadline for one phase's outstanding completions.
    #[serde(with = "humantime_serde")]
    pub completion_timeout: Option<Duration>,
    /// Clients that must release each point before the scan moves on.
    pub wait_for_clients: u32,
    /// Positioner slots.
    pub positioners: Vec<PositionerConfig>,
    /// Detector slots.
    pub detectors: Vec<DetectorConfig>,
    /// Trigger slots.
    pub triggers: Vec<TriggerConfig>,
    /// Hook run before the first pass.
    pub before_scan: Option<HookConfig>,
    /// Hook run after each pass.
    pub after_scan: Option<HookConfig>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            name: "scan".into(),
            max_points: default_capacity(),
            points: default_points(),
            freeze_points: false,
            acquisition: AcquisitionMode::default(),
            retrace: RetracePolicy::default(),
            reference_detector: 0,
            peak_smoothing_passes: 0,
            positioner_settle: Duration::ZERO,
            detector_settle: Duration::ZERO,
            resume_delay: Duration::ZERO,
            completion_timeout: None,
            wait_for_clients: 0,
            positioners: Vec::new(),
            detectors: Vec::new(),
            triggers: Vec::new(),
            before_scan: None,
            after_scan: None,
        }
    }
}

impl ScanConfig {
    /// Check slot counts, capacity and the reference detector.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` describing the first problem found.
    pub fn validate(&self) -> ScanResult<()> {
        let fail = |msg: String| Err(ScanError::Configuration(format!("scan '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(ScanError::Configuration("scan name must not be empty".into()));
        }
        validate_capacity(self.max_points)
            .map_err(|e| ScanError::Configuration(format!("scan '{}': {}", self.name, e)))?;
        if self.positioners.len() > MAX_POSITIONERS {
            return fail(format!(
                "{} positioners configured, at most {} allowed",
                self.positioners.len(),
                MAX_POSITIONERS
            ));
        }
        if self.triggers.len() > MAX_TRIGGERS {
            return fail(format!(
                "{} triggers configured, at most {} allowed",
                self.triggers.len(),
                MAX_TRIGGERS
            ));
        }
        if self.detectors.len() > MAX_DETECTORS {
            return fail(format!(
                "{} detectors configured, at most {} allowed",
                self.detectors.len(),
                MAX_DETECTORS
            ));
        }
        if !self.detectors.is_empty() && self.reference_detector >= self.detectors.len() {
            return fail(format!(
                "reference detector {} out of range (0..{})",
                self.reference_detector,
                self.detectors.len()
            ));
        }
        for (i, p) in self.positioners.iter().enumerate() {
            if p.drive.trim().is_empty() {
                return fail(format!("positioner {} has no drive channel", i + 1));
            }
            if let (Some(lo), Some(hi)) = (p.low_limit, p.high_limit) {
                if lo > hi {
                    return fail(format!("positioner {} low limit above high limit", i + 1));
                }
            }
        }
        for (i, t) in self.triggers.iter().enumerate() {
            if t.channel.is_some() && t.inner_scan.is_some() {
                return fail(format!(
                    "trigger {} names both a channel and an inner scan",
                    i + 1
                ));
            }
        }
        Ok(())
    }

    /// Points per pass after clamping to capacity, with the clamp diagnostic.
    pub fn clamped_points(&self) -> (usize, Option<ScanError>) {
        clamp_points(self.points, self.max_points)
    }

    /// Build the trajectory described by the positioner slots.
    pub fn trajectory(&self) -> Trajectory {
        let (npts, _) = self.clamped_points();
        let mut trajectory = Trajectory::new(npts, self.max_points);
        for p in &self.positioners {
            trajectory.push(p.axis(npts));
        }
        trajectory.set_points_frozen(self.freeze_points);
        trajectory
    }

    /// Names of inner scans referenced by triggers, with their trigger slot.
    pub fn inner_links(&self) -> Vec<(usize, &str)> {
        self.triggers
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| t.inner_scan.as_deref().map(|name| (slot, name)))
            .collect()
    }
}

/// Every scan of a nested set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSetConfig {
    /// Scans, in any order.
    pub scans: Vec<ScanConfig>,
}

impl ScanSetConfig {
    /// Load from a TOML file with `SCAN_DAQ_` environment overrides.
    ///
    /// # Errors
    ///
    /// `ScanError::Io` when the file does not exist, `ScanError::Configuration`
    /// for parse or validation failures.
    pub fn load_from(path: &Path) -> ScanResult<Self> {
        if !path.exists() {
            return Err(ScanError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file not found: {}", path.display()),
            )));
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| {
                ScanError::Configuration(format!("failed to parse {}: {}", path.display(), e))
            })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), scans = config.scans.len(), "scan configuration loaded");
        Ok(config)
    }

    /// Parse from a TOML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` for parse or validation failures.
    pub fn from_toml_str(content: &str) -> ScanResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ScanError::Configuration(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every scan plus the links between them.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` for duplicate names, unknown inner scans,
    /// an inner scan claimed by two parents, or a nesting cycle.
    pub fn validate(&self) -> ScanResult<()> {
        let mut names = HashSet::new();
        for scan in &self.scans {
            scan.validate()?;
            if !names.insert(scan.name.as_str()) {
                return Err(ScanError::Configuration(format!(
                    "duplicate scan name '{}'",
                    scan.name
                )));
            }
        }

        let mut parent_of: HashMap<&str, &str> = HashMap::new();
        for scan in &self.scans {
            for (_, inner) in scan.inner_links() {
                if !names.contains(inner) {
                    return Err(ScanError::Configuration(format!(
                        "scan '{}' links unknown inner scan '{}'",
                        scan.name, inner
                    )));
                }
                if let Some(previous) = parent_of.insert(inner, scan.name.as_str()) {
                    if previous != scan.name {
                        return Err(ScanError::Configuration(format!(
                            "scan '{}' is the inner scan of both '{}' and '{}'",
                            inner, previous, scan.name
                        )));
                    }
                }
            }
        }

        for scan in &self.scans {
            let mut seen = HashSet::new();
            let mut current = scan.name.as_str();
            while let Some(parent) = parent_of.get(current) {
                if !seen.insert(current) || *parent == scan.name {
                    return Err(ScanError::Configuration(format!(
                        "scan '{}' is part of a nesting cycle",
                        scan.name
                    )));
                }
                current = parent;
            }
        }
        Ok(())
    }

    /// Scan by name.
    pub fn scan(&self, name: &str) -> Option<&ScanConfig> {
        self.scans.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NESTED: &str = r#"
        [[scans]]
        name = "outer"
        points = 3
        retrace = "prior"
        positioner_settle = "20ms"

        [[scans.positioners]]
        drive = "motor:y"
        start = 0.0
        end = 2.0

        [[scans.triggers]]
        inner_scan = "inner"

        [[scans]]
        name = "inner"
        points = 6
        acquisition = "accumulate"

        [[scans.positioners]]
        drive = "motor:x"
        readback = "motor:x.rbv"
        start = 0.0
        increment = 2.0
        freeze = { increment = true }

        [[scans.detectors]]
        channel = "det:counts"
    "#;

    #[test]
    fn test_parse_nested_set() {
        let set = ScanSetConfig::from_toml_str(NESTED).unwrap();
        assert_eq!(set.scans.len(), 2);

        let outer = set.scan("outer").unwrap();
        assert_eq!(outer.positioner_settle, Duration::from_millis(20));
        assert_eq!(outer.retrace, RetracePolicy::Prior);
        assert_eq!(outer.inner_links(), vec![(0, "inner")]);

        let inner = set.scan("inner").unwrap();
        assert_eq!(inner.acquisition, AcquisitionMode::Accumulate);
        assert!(inner.positioners[0].freeze.increment);
        let trajectory = inner.trajectory();
        assert_eq!(trajectory.npts(), 6);
        assert_eq!(trajectory.axis(0).unwrap().params.end, 10.0);
    }

    #[test]
    fn test_too_many_positioners() {
        let config = ScanConfig {
            positioners: vec![
                PositionerConfig {
                    drive: "m".into(),
                    ..Default::default()
                };
                5
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most 4"));
    }

    #[test]
    fn test_unknown_inner_scan() {
        let set = ScanSetConfig {
            scans: vec![ScanConfig {
                triggers: vec![TriggerConfig {
                    inner_scan: Some("missing".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        assert!(set.validate().unwrap_err().to_string().contains("unknown inner scan"));
    }

    #[test]
    fn test_nesting_cycle_rejected() {
        let link = |name: &str, inner: &str| ScanConfig {
            name: name.into(),
            triggers: vec![TriggerConfig {
                inner_scan: Some(inner.into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let set = ScanSetConfig {
            scans: vec![link("a", "b"), link("b", "a")],
        };
        assert!(set.validate().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_reference_detector_range() {
        let config = ScanConfig {
            detectors: vec![DetectorConfig {
                channel: "d".into(),
            }],
            reference_detector: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamped_points() {
        let config = ScanConfig {
            max_points: 4,
            points: 9,
            ..Default::default()
        };
        let (npts, diag) = config.clamped_points();
        assert_eq!(npts, 4);
        assert!(diag.is_some());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NESTED.as_bytes()).unwrap();
        let set = ScanSetConfig::load_from(file.path()).unwrap();
        assert_eq!(set.scans[1].name, "inner");
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScanSetConfig::load_from(Path::new("/nonexistent/scan.toml")).unwrap_err();
        assert!(matches!(err, ScanError::Io(_)));
    }
}
