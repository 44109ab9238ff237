// src/blocks/statistics.rs - Statistical windowing block
use super::average::percentile;
use super::Block;
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Fixed-size sliding window, oldest sample evicted on insert.
    #[default]
    Rolling,
    /// Fill to `window_size`, then clear and start the next batch.
    Tumbling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileOutput {
    pub percentile: f64,
    pub output: SourceRef,
}

fn default_window_size() -> usize {
    100
}
fn default_min_samples() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub input: SourceRef,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub mode: WindowMode,
    /// Outputs are withheld until this many samples are present.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub min_output: Option<SourceRef>,
    #[serde(default)]
    pub max_output: Option<SourceRef>,
    #[serde(default)]
    pub mean_output: Option<SourceRef>,
    #[serde(default)]
    pub stddev_output: Option<SourceRef>,
    #[serde(default)]
    pub range_output: Option<SourceRef>,
    #[serde(default)]
    pub median_output: Option<SourceRef>,
    /// Coefficient of variation, `stddev / mean * 100`.
    #[serde(default)]
    pub cv_output: Option<SourceRef>,
    #[serde(default)]
    pub percentiles: Vec<PercentileOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StatisticsState {
    samples: Vec<f64>,
    batch_count: u64,
    last_reset: Option<DateTime<Utc>>,
}

pub struct StatisticsBlock {
    name: String,
    config: StatisticsConfig,
    state: StatisticsState,
}

impl StatisticsBlock {
    pub fn new(name: &str, config: &StatisticsConfig) -> Result<Self> {
        if !(10..=10_000).contains(&config.window_size) {
            return Err(EngineError::Config(format!(
                "statistics block '{}': window_size must be 10-10000",
                name
            )));
        }
        if config.min_samples < 1 || config.min_samples > config.window_size {
            return Err(EngineError::Config(format!(
                "statistics block '{}': min_samples must be 1-{}",
                name, config.window_size
            )));
        }
        for p in &config.percentiles {
            if !(0.0..=100.0).contains(&p.percentile) {
                return Err(EngineError::Config(format!(
                    "statistics block '{}': percentile {} out of range",
                    name, p.percentile
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: StatisticsState::default(),
        })
    }

    fn publish(&self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let samples = &self.state.samples;
        let n = samples.len();
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let min = sorted[0];
        let max = sorted[n - 1];
        let mean = samples.iter().sum::<f64>() / n as f64;

        let write = |out: &Option<SourceRef>, v: f64| -> Result<()> {
            if let Some(out) = out {
                store.write_or_add(out, Value::Float(v), now, None)?;
            }
            Ok(())
        };

        write(&self.config.min_output, min)?;
        write(&self.config.max_output, max)?;
        write(&self.config.mean_output, mean)?;
        write(&self.config.range_output, max - min)?;
        write(&self.config.median_output, percentile(&sorted, 50.0))?;

        if n >= 2 {
            let var =
                samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            let stddev = var.sqrt();
            write(&self.config.stddev_output, stddev)?;
            if mean != 0.0 {
                write(&self.config.cv_output, stddev / mean * 100.0)?;
            }
        }

        for p in &self.config.percentiles {
            store.write_or_add(
                &p.output,
                Value::Float(percentile(&sorted, p.percentile)),
                now,
                None,
            )?;
        }
        Ok(())
    }
}

impl Block for StatisticsBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let value = store.get_float(&self.config.input)?;
        if !value.is_finite() {
            return Ok(());
        }

        self.state.samples.push(value);
        if self.config.mode == WindowMode::Rolling {
            while self.state.samples.len() > self.config.window_size {
                self.state.samples.remove(0);
            }
        }

        if self.state.samples.len() >= self.config.min_samples {
            self.publish(store, now)?;
        }

        if self.config.mode == WindowMode::Tumbling
            && self.state.samples.len() >= self.config.window_size
        {
            self.state.samples.clear();
            self.state.batch_count += 1;
            self.state.last_reset = Some(now);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "STATISTICS"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state.samples.clear();
        Ok(())
    }
}
