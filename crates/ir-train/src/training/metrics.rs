//! Per-step metric accumulation and log records.
//!
//! Objectives record scalar loss components every step; at each log flush the
//! driver asks the objective to drain its accumulators into a [`LogRecord`].
//! Reported values are always means since the previous flush.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Collects values between two log flushes.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    values: Vec<f64>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the recorded values, `None` if nothing was recorded.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Return the mean and start a fresh accumulation window.
    pub fn drain_and_reset(&mut self) -> Option<f64> {
        let mean = self.mean();
        self.values.clear();
        mean
    }
}

/// Named loss components tracked by the objectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    CeLoss,
    DistilLoss,
    FlopsLoss,
    AntiZero,
    L0Docs,
    L0Queries,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::CeLoss,
        Metric::DistilLoss,
        Metric::FlopsLoss,
        Metric::AntiZero,
        Metric::L0Docs,
        Metric::L0Queries,
    ];

    /// Key under which the metric appears in log records.
    pub fn key(self) -> &'static str {
        match self {
            Metric::CeLoss => "ce_loss",
            Metric::DistilLoss => "distil_loss",
            Metric::FlopsLoss => "flops_loss",
            Metric::AntiZero => "anti-zero",
            Metric::L0Docs => "L0_d",
            Metric::L0Queries => "L0_q",
        }
    }
}

/// The accumulators owned by one objective.
#[derive(Debug, Clone, Default)]
pub struct LossMetrics {
    accumulators: BTreeMap<Metric, MetricAccumulator>,
}

impl LossMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: Metric, value: f64) {
        self.accumulators.entry(metric).or_default().record(value);
    }

    pub fn pending(&self, metric: Metric) -> usize {
        self.accumulators.get(&metric).map_or(0, MetricAccumulator::len)
    }

    /// Write the mean of each listed metric into `logs` and reset all
    /// accumulators. Metrics with nothing recorded are left out.
    pub fn flush_into(&mut self, metrics: &[Metric], logs: &mut LogRecord) {
        for &metric in metrics {
            if let Some(mean) = self.accumulators.get_mut(&metric).and_then(|a| a.drain_and_reset()) {
                logs.insert(metric.key(), mean);
            }
        }
        for acc in self.accumulators.values_mut() {
            acc.drain_and_reset();
        }
    }
}

/// One structured log entry emitted at a flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl LogRecord {
    pub fn new(step: usize) -> Self {
        Self {
            step,
            epoch: None,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Compact `key=value` rendering for log lines.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.values.len() + 1);
        if let Some(epoch) = self.epoch {
            parts.push(format!("epoch={epoch:.2}"));
        }
        parts.extend(self.values.iter().map(|(k, v)| format!("{k}={v:.4}")));
        parts.join(" ")
    }

    /// Warnings about degenerate training signals in this record.
    ///
    /// Flags sparse representations that have collapsed to all-zero and any
    /// non-finite value.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for metric in [Metric::L0Docs, Metric::L0Queries] {
            if self.get(metric.key()) == Some(0.0) {
                warnings.push(format!(
                    "{} is 0: representations collapsed to all-zero",
                    metric.key()
                ));
            }
        }
        for (key, value) in &self.values {
            if !value.is_finite() {
                warnings.push(format!("{key} is not finite ({value})"));
            }
        }
        warnings
    }
}

/// Round to two decimals, as reported for the epoch fraction.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
