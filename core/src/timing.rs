//! Run telemetry, grounded on `plonky2/src/util/timing.rs`'s `TimingTree`
//! but flattened to the handful of named aggregates the benchmark contract
//! asks for rather than a nested tree: one `Samples` accumulator per
//! measured phase, reported as mean/std/min/max in seconds plus the
//! challenge pass/fail boolean.

use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct Samples {
    values: Vec<f64>,
}

impl Samples {
    pub fn new() -> Self {
        Samples { values: Vec::new() }
    }

    pub fn push_secs(&mut self, d: Duration) {
        self.values.push(d.as_secs_f64());
    }

    pub fn push(&mut self, v: f64) {
        self.values.push(v);
    }

    /// Merges another worker's samples into this one (used to fold every
    /// thread's per-layer timings into one rank-wide report).
    pub fn extend(&mut self, other: &Samples) {
        self.values.extend_from_slice(&other.values);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance =
            self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.values.len() as f64;
        variance.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.values.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// The run's complete telemetry surface: one phase per reported
/// aggregate.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub exec: Samples,
    pub spmm_symb: Samples,
    pub spmm_numeric: Samples,
    pub realloc: Samples,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry::default()
    }

    /// Formats the tab-separated telemetry line the benchmark contract
    /// requires: `{exec_mean, exec_std, exec_min, exec_max, spmm_symb_mean,
    /// spmm_numeric_mean, realloc_mean}` in seconds, plus challenge
    /// pass/fail.
    pub fn report_line(&self, challenge_pass: bool) -> String {
        format!(
            "{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}",
            self.exec.mean(),
            self.exec.std_dev(),
            if self.exec.is_empty() { 0.0 } else { self.exec.min() },
            if self.exec.is_empty() { 0.0 } else { self.exec.max() },
            self.spmm_symb.mean(),
            self.spmm_numeric.mean(),
            self.realloc.mean(),
            challenge_pass,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_std_min_max_over_known_samples() {
        let mut s = Samples::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            s.push(v);
        }
        assert_eq!(s.mean(), 2.5);
        assert_eq!(s.min(), 1.0);
        assert_eq!(s.max(), 4.0);
        assert!((s.std_dev() - 1.118_034).abs() < 1e-5);
    }

    #[test]
    fn report_line_has_eight_fields() {
        let mut t = Telemetry::new();
        t.exec.push(0.1);
        t.spmm_symb.push(0.01);
        t.spmm_numeric.push(0.02);
        t.realloc.push(0.001);
        let line = t.report_line(true);
        assert_eq!(line.split('\t').count(), 8);
    }
}
