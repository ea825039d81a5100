//! Plain-text rendering of performance summaries: one row per metric, one
//! column per algorithm, `NA` wherever a metric has no value.

use super::performance::{PerformanceSummary, Quartiles};
use itertools::Itertools;
use std::fmt;

const MISSING: &str = "NA";

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceTable {
    header: Vec<String>,
    rows: Vec<(String, Vec<String>)>,
}

fn quartile_rows(
    label: &str,
    summaries: &[PerformanceSummary],
    pick: impl Fn(&PerformanceSummary) -> Option<Quartiles>,
    precision: usize,
) -> Vec<(String, Vec<String>)> {
    let parts: [(&str, fn(&Quartiles) -> f64); 3] = [
        ("Q1", |q| q.lower),
        ("median", |q| q.median),
        ("Q3", |q| q.upper),
    ];
    parts
        .iter()
        .map(|(name, part)| {
            let cells = summaries
                .iter()
                .map(|s| match pick(s) {
                    Some(q) => format!("{:.*}", precision, part(&q)),
                    None => MISSING.to_string(),
                })
                .collect();
            (format!("{label} {name}"), cells)
        })
        .collect()
}

impl PerformanceTable {
    pub fn from_summaries(summaries: &[PerformanceSummary]) -> Self {
        let header = summaries.iter().map(|s| s.algorithm.to_string()).collect();
        let counts: [(&str, fn(&PerformanceSummary) -> usize); 6] = [
            ("Runs", |s| s.runs),
            ("Failed runs", |s| s.failed),
            ("Non-converged runs", |s| s.non_converged),
            ("Cancelled runs", |s| s.cancelled),
            ("Runs with a decrease", |s| s.runs_with_decrease),
            ("Local modes", |s| s.local_modes),
        ];
        let mut rows: Vec<(String, Vec<String>)> = counts
            .iter()
            .map(|(label, get)| {
                (
                    label.to_string(),
                    summaries.iter().map(|s| get(s).to_string()).collect(),
                )
            })
            .collect();
        rows.extend(quartile_rows("Local-mode gap", summaries, |s| s.local_mode_gap, 4));
        rows.extend(quartile_rows(
            "Iterations at global max",
            summaries,
            |s| s.global_iterations,
            1,
        ));
        rows.push((
            "Mean seconds per run".to_string(),
            summaries
                .iter()
                .map(|s| {
                    if s.runs == 0 {
                        MISSING.to_string()
                    } else {
                        format!("{:.3}", s.mean_seconds)
                    }
                })
                .collect(),
        ));
        Self { header, rows }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|(label, _)| label.as_str())
    }

    /// The cell for `metric` in the column of the `column`-th algorithm.
    pub fn cell(&self, metric: &str, column: usize) -> Option<&str> {
        self.rows
            .iter()
            .find(|(label, _)| label == metric)
            .and_then(|(_, cells)| cells.get(column))
            .map(String::as_str)
    }
}

impl fmt::Display for PerformanceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label_width = self.rows.iter().map(|(l, _)| l.len()).max().unwrap_or(0);
        let widths: Vec<usize> = self
            .header
            .iter()
            .enumerate()
            .map(|(c, h)| {
                self.rows
                    .iter()
                    .filter_map(|(_, cells)| cells.get(c).map(String::len))
                    .chain(std::iter::once(h.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let header = self
            .header
            .iter()
            .zip(&widths)
            .map(|(h, &w)| format!("{h:>w$}"))
            .join("  ");
        writeln!(f, "{:label_width$}  {header}", "")?;
        for (label, cells) in &self.rows {
            let line = cells
                .iter()
                .zip(&widths)
                .map(|(cell, &w)| format!("{cell:>w$}"))
                .join("  ");
            writeln!(f, "{label:<label_width$}  {line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Algorithm;

    fn summary(algorithm: Algorithm, global_iterations: Option<Quartiles>) -> PerformanceSummary {
        PerformanceSummary {
            algorithm,
            runs: 4,
            failed: 1,
            non_converged: 0,
            cancelled: 0,
            runs_with_decrease: 2,
            global_maxima: 3,
            local_modes: 0,
            local_mode_gap: None,
            global_iterations,
            mean_seconds: 0.25,
        }
    }

    #[test]
    fn test_missing_metrics_render_as_na() {
        let q = Quartiles {
            lower: 10.0,
            median: 12.5,
            upper: 20.0,
        };
        let table = PerformanceTable::from_summaries(&[
            summary(Algorithm::Nested, Some(q)),
            summary(Algorithm::ThreeStepCorrected, None),
        ]);
        assert_eq!(table.header(), ["nested".to_string(), "3step-corrected".to_string()]);
        assert_eq!(table.cell("Runs", 0), Some("4"));
        assert_eq!(table.cell("Local-mode gap median", 0), Some("NA"));
        assert_eq!(table.cell("Iterations at global max median", 0), Some("12.5"));
        assert_eq!(table.cell("Iterations at global max Q1", 1), Some("NA"));
        assert_eq!(table.cell("Mean seconds per run", 1), Some("0.250"));
        assert_eq!(table.cell("No such metric", 0), None);
    }

    #[test]
    fn test_rendered_rows_align() {
        let table = PerformanceTable::from_summaries(&[summary(Algorithm::Nested, None)]);
        let rendered = table.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), table.metrics().count() + 1);
        let width = lines[0].len();
        assert!(lines.iter().all(|l| l.len() == width));
        assert!(lines.iter().any(|l| l.starts_with("Runs with a decrease")));
    }
}
