//! Printable summaries of finished passes and previews.

use daq_scan::{Preview, Scan, ScanOutcome};
use serde::Serialize;
use std::fmt::Write;

/// One finished pass with its published arrays.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub scan: String,
    pub pass: u32,
    pub points: usize,
    pub aborted: bool,
    pub message: String,
    pub generation: u64,
    pub mark: Option<usize>,
    pub positioners: Vec<Vec<f64>>,
    pub detectors: Vec<Vec<f64>>,
}

impl PassReport {
    /// Capture the arrays `scan` published for `outcome`.
    pub fn capture(scan: &Scan, pass: u32, outcome: &ScanOutcome) -> Self {
        let view = scan.buffers().snapshot();
        let config = scan.config();
        let positioners = (0..config.positioners.len())
            .map(|i| view.positioner(i).map(|s| s.acquired().to_vec()).unwrap_or_default())
            .collect();
        let detectors = (0..config.detectors.len())
            .map(|i| view.detector(i).map(|s| s.acquired().to_vec()).unwrap_or_default())
            .collect();
        Self {
            scan: outcome.scan.clone(),
            pass,
            points: outcome.points,
            aborted: outcome.aborted,
            message: outcome.message.clone(),
            generation: outcome.generation,
            mark: scan.status().mark,
            positioners,
            detectors,
        }
    }

    /// Human-readable table, one row per point.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let state = if self.aborted { "aborted" } else { "complete" };
        let _ = writeln!(
            out,
            "scan '{}' pass {} {}: {} point(s), {}",
            self.scan,
            self.pass,
            state,
            self.points,
            self.message.trim()
        );

        let columns: Vec<(String, &Vec<f64>)> = self
            .positioners
            .iter()
            .enumerate()
            .map(|(i, data)| (format!("P{}", i + 1), data))
            .chain(
                self.detectors
                    .iter()
                    .enumerate()
                    .map(|(i, data)| (format!("D{:02}", i + 1), data)),
            )
            .collect();
        if columns.is_empty() {
            return out;
        }

        let _ = write!(out, "{:>6}", "point");
        for (label, _) in &columns {
            let _ = write!(out, "{:>14}", label);
        }
        out.push('\n');
        for point in 0..self.points {
            let marker = if self.mark == Some(point) { '*' } else { ' ' };
            let _ = write!(out, "{:>5}{}", point, marker);
            for (_, data) in &columns {
                match data.get(point) {
                    Some(value) => {
                        let _ = write!(out, "{:>14.6}", value);
                    }
                    None => {
                        let _ = write!(out, "{:>14}", "-");
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Planned positions as a table.
pub fn render_preview(scan: &str, preview: &Preview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "scan '{}' planned positions", scan);
    let points = preview.positions.iter().map(Vec::len).max().unwrap_or(0);
    let _ = write!(out, "{:>6}", "point");
    for i in 0..preview.positions.len() {
        let _ = write!(out, "{:>14}", format!("P{}", i + 1));
    }
    out.push('\n');
    for point in 0..points {
        let _ = write!(out, "{:>6}", point);
        for row in &preview.positions {
            match row.get(point) {
                Some(value) => {
                    let _ = write!(out, "{:>14.6}", value);
                }
                None => {
                    let _ = write!(out, "{:>14}", "-");
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> PassReport {
        PassReport {
            scan: "energy".into(),
            pass: 1,
            points: 3,
            aborted: false,
            message: "SCAN Complete: PEAK POS found.".into(),
            generation: 1,
            mark: Some(1),
            positioners: vec![vec![0.0, 1.0, 2.0]],
            detectors: vec![vec![1.0, 5.0, 1.0]],
        }
    }

    #[test]
    fn test_render_marks_peak_row() {
        let text = report().render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("3 point(s)"));
        assert!(lines[0].contains("PEAK POS found."));
        assert!(lines[1].contains("P1") && lines[1].contains("D01"));
        assert!(lines[3].starts_with("    1*"));
        assert!(lines[3].contains("5.000000"));
    }

    #[test]
    fn test_render_without_slots() {
        let mut report = report();
        report.positioners.clear();
        report.detectors.clear();
        assert_eq!(report.render().lines().count(), 1);
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["points"], 3);
        assert_eq!(json["detectors"][0][1], 5.0);
    }

    #[test]
    fn test_render_preview() {
        let preview = Preview {
            positions: vec![vec![0.0, 2.0], vec![1.0, 1.0]],
        };
        let text = render_preview("s", &preview);
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().nth(3).unwrap().contains("2.000000"));
    }
}
