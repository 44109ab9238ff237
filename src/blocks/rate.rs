// src/blocks/rate.rs - Rate-of-change estimation block
use super::{elapsed_secs, Block};
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
pub enum RateMethod {
    #[default]
    SimpleDifference,
    /// Mean of recent sample-to-sample derivatives over the time window.
    MovingAverage,
    /// Exponential recency weighting of recent derivatives.
    WeightedAverage,
    /// Least-squares slope over the sample window; needs at least 5 samples.
    LinearRegression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateTimeUnit {
    #[default]
    PerSecond,
    PerMinute,
    PerHour,
}

impl RateTimeUnit {
    fn factor(self) -> f64 {
        match self {
            RateTimeUnit::PerSecond => 1.0,
            RateTimeUnit::PerMinute => 60.0,
            RateTimeUnit::PerHour => 3600.0,
        }
    }
}

/// Optional high/low rate alarm outputs. An alarm engages when the rate
/// crosses its threshold and clears at `threshold * hysteresis_ratio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateThresholds {
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default = "default_hysteresis_ratio")]
    pub hysteresis_ratio: f64,
    #[serde(default)]
    pub high_output: Option<SourceRef>,
    #[serde(default)]
    pub low_output: Option<SourceRef>,
}

fn default_hysteresis_ratio() -> f64 {
    0.9
}
fn default_time_window() -> f64 {
    60.0
}
fn default_baseline() -> usize {
    1
}
fn default_smoothing_alpha() -> f64 {
    1.0
}
fn default_decimal_places() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    pub input: SourceRef,
    pub output: SourceRef,
    #[serde(default)]
    pub method: RateMethod,
    #[serde(default = "default_time_window")]
    pub time_window_secs: f64,
    /// Number of initial samples ignored while the input settles.
    #[serde(default = "default_baseline")]
    pub baseline_sample_count: usize,
    /// Exponential smoothing applied to the computed rate; 1.0 disables it.
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    #[serde(default)]
    pub time_unit: RateTimeUnit,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u32,
    #[serde(default)]
    pub thresholds: Option<RateThresholds>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RateState {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    derivatives: VecDeque<(DateTime<Utc>, f64)>,
    sample_count: u64,
    smoothed: Option<f64>,
    high_latch: bool,
    low_latch: bool,
}

pub struct RateOfChangeBlock {
    name: String,
    config: RateConfig,
    state: RateState,
}

impl RateOfChangeBlock {
    pub fn new(name: &str, config: &RateConfig) -> Result<Self> {
        if config.time_window_secs <= 0.0 {
            return Err(EngineError::Config(format!(
                "rate block '{}': time_window_secs must be positive",
                name
            )));
        }
        if !(config.smoothing_alpha > 0.0 && config.smoothing_alpha <= 1.0) {
            return Err(EngineError::Config(format!(
                "rate block '{}': smoothing_alpha must be in (0, 1]",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: RateState::default(),
        })
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.config.time_window_secs;
        while let Some((ts, _)) = self.state.samples.front() {
            if elapsed_secs(*ts, now) > window && self.state.samples.len() > 2 {
                self.state.samples.pop_front();
            } else {
                break;
            }
        }
        while let Some((ts, _)) = self.state.derivatives.front() {
            if elapsed_secs(*ts, now) > window {
                self.state.derivatives.pop_front();
            } else {
                break;
            }
        }
    }

    /// Raw per-second derivative, or `None` when it cannot be computed yet.
    fn derivative(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let n = self.state.samples.len();
        if n < 2 {
            return None;
        }
        let (t_prev, v_prev) = self.state.samples[n - 2];
        let (t_cur, v_cur) = self.state.samples[n - 1];
        let dt = elapsed_secs(t_prev, t_cur);
        if dt <= 0.0 {
            return None;
        }
        let diff = (v_cur - v_prev) / dt;

        match self.config.method {
            RateMethod::SimpleDifference => Some(diff),
            RateMethod::MovingAverage => {
                self.state.derivatives.push_back((t_cur, diff));
                let sum: f64 = self.state.derivatives.iter().map(|(_, d)| d).sum();
                Some(sum / self.state.derivatives.len() as f64)
            }
            RateMethod::WeightedAverage => {
                self.state.derivatives.push_back((t_cur, diff));
                let tau = self.config.time_window_secs / 3.0;
                let mut sum = 0.0;
                let mut weight_sum = 0.0;
                for (ts, d) in &self.state.derivatives {
                    let w = (-elapsed_secs(*ts, now) / tau).exp();
                    sum += w * d;
                    weight_sum += w;
                }
                if weight_sum == 0.0 {
                    None
                } else {
                    Some(sum / weight_sum)
                }
            }
            RateMethod::LinearRegression => {
                if n < 5 {
                    return None;
                }
                let t0 = self.state.samples[0].0;
                let xs: Vec<f64> = self
                    .state
                    .samples
                    .iter()
                    .map(|(ts, _)| elapsed_secs(t0, *ts))
                    .collect();
                let ys: Vec<f64> = self.state.samples.iter().map(|(_, v)| *v).collect();
                let count = n as f64;
                let x_mean = xs.iter().sum::<f64>() / count;
                let y_mean = ys.iter().sum::<f64>() / count;
                let sxx: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
                if sxx == 0.0 {
                    return None;
                }
                let sxy: f64 = xs
                    .iter()
                    .zip(&ys)
                    .map(|(x, y)| (x - x_mean) * (y - y_mean))
                    .sum();
                Some(sxy / sxx)
            }
        }
    }

    fn update_threshold_outputs(
        &mut self,
        store: &PointStore,
        now: DateTime<Utc>,
        rate: f64,
    ) -> Result<()> {
        let Some(thresholds) = self.config.thresholds.clone() else {
            return Ok(());
        };
        if let Some(high) = thresholds.high {
            if rate > high {
                self.state.high_latch = true;
            } else if rate < high * thresholds.hysteresis_ratio {
                self.state.high_latch = false;
            }
            if let Some(out) = &thresholds.high_output {
                store.write_or_add(out, Value::Bool(self.state.high_latch), now, None)?;
            }
        }
        if let Some(low) = thresholds.low {
            if rate < low {
                self.state.low_latch = true;
            } else if rate > low * thresholds.hysteresis_ratio {
                self.state.low_latch = false;
            }
            if let Some(out) = &thresholds.low_output {
                store.write_or_add(out, Value::Bool(self.state.low_latch), now, None)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn round_to(value: f64, decimal_places: u32) -> f64 {
    let factor = 10f64.powi(decimal_places as i32);
    (value * factor).round() / factor
}

impl Block for RateOfChangeBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let value = store.get_float(&self.config.input)?;
        if !value.is_finite() {
            return Ok(());
        }

        self.state.sample_count += 1;
        self.state.samples.push_back((now, value));
        self.prune(now);

        // Baseline phase: record samples but publish nothing.
        if self.state.sample_count <= self.config.baseline_sample_count as u64 {
            return Ok(());
        }

        let Some(raw) = self.derivative(now) else {
            return Ok(());
        };

        let alpha = self.config.smoothing_alpha;
        let smoothed = match self.state.smoothed {
            Some(prev) => alpha * raw + (1.0 - alpha) * prev,
            None => raw,
        };
        self.state.smoothed = Some(smoothed);

        let converted = smoothed * self.config.time_unit.factor();
        let rounded = round_to(converted, self.config.decimal_places);
        store.write_or_add(&self.config.output, Value::Float(rounded), now, None)?;

        self.update_threshold_outputs(store, now, converted)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "RATE_OF_CHANGE"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = RateState::default();
        Ok(())
    }
}
