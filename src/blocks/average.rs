// src/blocks/average.rs - Moving-average / filter block
use super::Block;
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AverageAlgorithm {
    #[default]
    Simple,
    Exponential,
    Weighted,
}

/// Outlier rejection applied to the candidate values before averaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OutlierConfig {
    /// Drop values outside `[Q1 - k*IQR, Q3 + k*IQR]`.
    Iqr {
        #[serde(default = "default_iqr_k")]
        k: f64,
    },
    /// Drop values with `|z| > threshold`.
    ZScore {
        #[serde(default = "default_z_threshold")]
        threshold: f64,
    },
}

fn default_iqr_k() -> f64 {
    1.5
}
fn default_z_threshold() -> f64 {
    3.0
}
fn default_window_size() -> usize {
    10
}
fn default_alpha() -> f64 {
    0.2
}
fn default_minimum_inputs() -> usize {
    1
}
fn default_stale_timeout() -> f64 {
    300.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AverageConfig {
    /// A single source averages over a sample window; multiple sources are
    /// plain-averaged each tick.
    pub inputs: Vec<SourceRef>,
    pub output: SourceRef,
    #[serde(default)]
    pub algorithm: AverageAlgorithm,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// EMA smoothing factor.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Custom weights for the weighted algorithm, oldest first. When absent,
    /// linear weights `[1..N]` are used (most recent highest).
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default = "default_minimum_inputs")]
    pub minimum_inputs: usize,
    #[serde(default)]
    pub ignore_stale: bool,
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: f64,
    #[serde(default)]
    pub outlier: Option<OutlierConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AverageState {
    window: VecDeque<f64>,
    ema: Option<f64>,
}

pub struct AverageBlock {
    name: String,
    config: AverageConfig,
    state: AverageState,
}

impl AverageBlock {
    pub fn new(name: &str, config: &AverageConfig) -> Result<Self> {
        if config.inputs.is_empty() {
            return Err(EngineError::Config(format!(
                "average block '{}' requires at least one input",
                name
            )));
        }
        if !(2..=1000).contains(&config.window_size) {
            return Err(EngineError::Config(format!(
                "average block '{}': window_size must be 2-1000",
                name
            )));
        }
        if !(config.alpha > 0.0 && config.alpha <= 1.0) {
            return Err(EngineError::Config(format!(
                "average block '{}': alpha must be in (0, 1]",
                name
            )));
        }
        if let Some(weights) = &config.weights {
            if weights.len() != config.window_size {
                return Err(EngineError::Config(format!(
                    "average block '{}': {} weights do not match window_size {}",
                    name,
                    weights.len(),
                    config.window_size
                )));
            }
            if weights.iter().any(|w| *w <= 0.0) {
                return Err(EngineError::Config(format!(
                    "average block '{}': weights must all be positive",
                    name
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: AverageState::default(),
        })
    }

    /// Fetch current values, dropping unreadable and (optionally) stale
    /// sources.
    fn fetch(&self, store: &PointStore, now: DateTime<Utc>) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.config.inputs.len());
        for input in &self.config.inputs {
            let v = match store.get_float(input) {
                Ok(v) if v.is_finite() => v,
                _ => continue,
            };
            if self.config.ignore_stale {
                match store.age_secs(input, now) {
                    Ok(age) if age <= self.config.stale_timeout_secs => {}
                    _ => continue,
                }
            }
            values.push(v);
        }
        values
    }

    fn weighted_mean(&self, window: &VecDeque<f64>) -> f64 {
        // Custom weights cover a full window; while filling, the most recent
        // (= highest) weights apply.
        let n = window.len();
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        for (i, v) in window.iter().enumerate() {
            let w = match &self.config.weights {
                Some(weights) => weights[weights.len() - n + i],
                None => (i + 1) as f64,
            };
            sum += w * v;
            weight_sum += w;
        }
        sum / weight_sum
    }
}

impl Block for AverageBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let mut values = self.fetch(store, now);

        let single_source = self.config.inputs.len() == 1;
        let mut tick_sample = None;
        if single_source {
            // The window is the sample set; extend it with the current value
            // before filtering.
            if let Some(v) = values.pop() {
                tick_sample = Some(v);
                self.state.window.push_back(v);
                while self.state.window.len() > self.config.window_size {
                    self.state.window.pop_front();
                }
            }
            values = self.state.window.iter().copied().collect();
        }

        if let Some(outlier) = &self.config.outlier {
            values = filter_outliers(values, outlier);
        }

        if values.len() < self.config.minimum_inputs || values.is_empty() {
            // Data-quality no-write outcome, not an error.
            return Ok(());
        }

        let result = match self.config.algorithm {
            AverageAlgorithm::Simple => values.iter().sum::<f64>() / values.len() as f64,
            AverageAlgorithm::Exponential => {
                // Filtering preserves window order, so a surviving current
                // sample is still the newest value.
                let current = if single_source {
                    tick_sample.filter(|v| values.last() == Some(v))
                } else {
                    Some(values.iter().sum::<f64>() / values.len() as f64)
                };
                match current {
                    Some(c) => {
                        let ema = match self.state.ema {
                            Some(prev) => {
                                self.config.alpha * c + (1.0 - self.config.alpha) * prev
                            }
                            None => c,
                        };
                        self.state.ema = Some(ema);
                        ema
                    }
                    // The current sample was rejected as an outlier; the
                    // filter holds its previous value.
                    None => match self.state.ema {
                        Some(prev) => prev,
                        None => return Ok(()),
                    },
                }
            }
            AverageAlgorithm::Weighted => {
                let window: VecDeque<f64> = values.into_iter().collect();
                self.weighted_mean(&window)
            }
        };

        store.write_or_add(&self.config.output, Value::Float(result), now, None)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "AVERAGE"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = AverageState::default();
        Ok(())
    }
}

/// Remove outliers from a candidate set. Small sets are passed through
/// unchanged since quartiles and z-scores are meaningless there.
fn filter_outliers(values: Vec<f64>, config: &OutlierConfig) -> Vec<f64> {
    match config {
        OutlierConfig::Iqr { k } => {
            if values.len() < 4 {
                return values;
            }
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let q1 = percentile(&sorted, 25.0);
            let q3 = percentile(&sorted, 75.0);
            let iqr = q3 - q1;
            let (lo, hi) = (q1 - k * iqr, q3 + k * iqr);
            values.into_iter().filter(|v| *v >= lo && *v <= hi).collect()
        }
        OutlierConfig::ZScore { threshold } => {
            if values.len() < 3 {
                return values;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (values.len() - 1) as f64;
            let stddev = var.sqrt();
            if stddev == 0.0 {
                return values;
            }
            values
                .into_iter()
                .filter(|v| ((v - mean) / stddev).abs() <= *threshold)
                .collect()
        }
    }
}

/// Linear-interpolated percentile over a sorted slice.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}
