// src/blocks/selector.rs - Min/max input selector block
use super::Block;
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    Min,
    Max,
}

/// Behavior when one or more inputs are bad (missing, non-finite or stale).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMode {
    /// Select among the remaining good inputs.
    #[default]
    IgnoreBad,
    /// When the selected input goes bad, re-select using the opposite
    /// extremum of the remaining good inputs.
    FallbackToOpposite,
    /// When the selected input goes bad, freeze the output and selected
    /// index at their last valid values.
    HoldLastGood,
}

fn default_stale_timeout() -> Option<f64> {
    Some(300.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxConfig {
    pub inputs: Vec<SourceRef>,
    pub output: SourceRef,
    pub mode: SelectMode,
    #[serde(default)]
    pub failover: FailoverMode,
    /// Inputs older than this are treated as bad. `None` disables the check.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: Option<f64>,
    /// Receives the 1-based index of the selected input.
    #[serde(default)]
    pub index_output: Option<SourceRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SelectorState {
    last_output: Option<f64>,
    last_index: Option<usize>,
}

pub struct MinMaxBlock {
    name: String,
    config: MinMaxConfig,
    state: SelectorState,
}

impl MinMaxBlock {
    pub fn new(name: &str, config: &MinMaxConfig) -> Result<Self> {
        if !(2..=16).contains(&config.inputs.len()) {
            return Err(EngineError::Config(format!(
                "minmax block '{}': 2-16 inputs required",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: SelectorState::default(),
        })
    }

    fn extreme(mode: SelectMode, good: &[(usize, f64)]) -> Option<(usize, f64)> {
        match mode {
            SelectMode::Min => good
                .iter()
                .copied()
                .min_by(|a, b| a.1.total_cmp(&b.1)),
            SelectMode::Max => good
                .iter()
                .copied()
                .max_by(|a, b| a.1.total_cmp(&b.1)),
        }
    }
}

impl Block for MinMaxBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let mut good: Vec<(usize, f64)> = Vec::with_capacity(self.config.inputs.len());
        for (i, input) in self.config.inputs.iter().enumerate() {
            let value = match store.get_float(input) {
                Ok(v) if v.is_finite() => v,
                _ => continue,
            };
            if let Some(timeout) = self.config.stale_timeout_secs {
                if store.age_secs(input, now)? > timeout {
                    continue;
                }
            }
            good.push((i, value));
        }
        // Failover keys on the previously selected input, not the health of
        // the whole input set.
        let selected_bad = self
            .state
            .last_index
            .map_or(false, |last| !good.iter().any(|(i, _)| *i == last));

        let selected = if good.is_empty() {
            if self.state.last_output.is_none() {
                // No history to fall back on yet, withhold the output.
                warn!(block = %self.name, "all inputs bad and no prior selection");
                return Ok(());
            }
            None
        } else {
            match self.config.failover {
                FailoverMode::IgnoreBad => Self::extreme(self.config.mode, &good),
                FailoverMode::FallbackToOpposite if selected_bad => {
                    let opposite = match self.config.mode {
                        SelectMode::Min => SelectMode::Max,
                        SelectMode::Max => SelectMode::Min,
                    };
                    Self::extreme(opposite, &good)
                }
                FailoverMode::FallbackToOpposite => Self::extreme(self.config.mode, &good),
                // Freeze output and index at the last valid selection
                FailoverMode::HoldLastGood if selected_bad => None,
                FailoverMode::HoldLastGood => Self::extreme(self.config.mode, &good),
            }
        };

        let (index, value) = match selected {
            Some((i, v)) => (Some(i), v),
            None => match self.state.last_output {
                Some(v) => (self.state.last_index, v),
                None => return Ok(()),
            },
        };

        self.state.last_output = Some(value);
        self.state.last_index = index;

        store.write_or_add(&self.config.output, Value::Float(value), now, None)?;
        if let (Some(out), Some(i)) = (&self.config.index_output, index) {
            store.write_or_add(out, Value::Int(i as i64 + 1), now, None)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "MIN_MAX"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = SelectorState::default();
        Ok(())
    }
}
