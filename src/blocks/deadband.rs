// src/blocks/deadband.rs - Deadband / stability filtering block
use super::{elapsed_secs, Block};
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeadbandMode {
    /// Pass a new output when `|current - last_output| > deadband`.
    Absolute { deadband: f64 },
    /// Deadband expressed as a percentage of the input span.
    Percentage {
        deadband_percent: f64,
        input_min: f64,
        input_max: f64,
    },
    /// Pass a new output when the input moves faster than
    /// `rate_threshold` units per second.
    RateOfChange { rate_threshold: f64 },
    /// Digital debounce: a state change must hold for `stability_time_secs`
    /// before it is committed; a flip restarts the timer.
    Digital { stability_time_secs: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadbandConfig {
    pub input: SourceRef,
    pub output: SourceRef,
    #[serde(flatten)]
    pub mode: DeadbandMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeadbandState {
    last_output: Option<f64>,
    last_input: Option<(DateTime<Utc>, f64)>,
    committed: Option<bool>,
    candidate: Option<bool>,
    candidate_since: Option<DateTime<Utc>>,
}

pub struct DeadbandBlock {
    name: String,
    config: DeadbandConfig,
    state: DeadbandState,
}

impl DeadbandBlock {
    pub fn new(name: &str, config: &DeadbandConfig) -> Result<Self> {
        match &config.mode {
            DeadbandMode::Absolute { deadband } if *deadband < 0.0 => {
                return Err(EngineError::Config(format!(
                    "deadband block '{}': deadband must be non-negative",
                    name
                )))
            }
            DeadbandMode::Percentage {
                input_min,
                input_max,
                ..
            } if input_max <= input_min => {
                return Err(EngineError::Config(format!(
                    "deadband block '{}': input_max must exceed input_min",
                    name
                )))
            }
            DeadbandMode::Digital {
                stability_time_secs,
            } if *stability_time_secs < 0.0 => {
                return Err(EngineError::Config(format!(
                    "deadband block '{}': stability_time_secs must be non-negative",
                    name
                )))
            }
            _ => {}
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: DeadbandState::default(),
        })
    }

    fn execute_analog(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let current = store.get_float(&self.config.input)?;

        let pass = match (&self.config.mode, self.state.last_output) {
            (_, None) => true,
            (DeadbandMode::Absolute { deadband }, Some(last)) => (current - last).abs() > *deadband,
            (
                DeadbandMode::Percentage {
                    deadband_percent,
                    input_min,
                    input_max,
                },
                Some(last),
            ) => {
                let band = deadband_percent / 100.0 * (input_max - input_min);
                (current - last).abs() > band
            }
            (DeadbandMode::RateOfChange { rate_threshold }, Some(_)) => {
                match self.state.last_input {
                    Some((ts, last_in)) => {
                        let dt = elapsed_secs(ts, now);
                        dt > 0.0 && ((current - last_in) / dt).abs() > *rate_threshold
                    }
                    None => true,
                }
            }
            (DeadbandMode::Digital { .. }, _) => unreachable!("dispatched in execute"),
        };

        self.state.last_input = Some((now, current));
        if pass {
            self.state.last_output = Some(current);
            store.write_or_add(&self.config.output, Value::Float(current), now, None)?;
        }
        Ok(())
    }

    fn execute_digital(
        &mut self,
        store: &PointStore,
        now: DateTime<Utc>,
        stability_time_secs: f64,
    ) -> Result<()> {
        let current = store.get_bool(&self.config.input)?;

        let committed = match self.state.committed {
            None => {
                // First observation establishes the output immediately.
                self.state.committed = Some(current);
                store.write_or_add(&self.config.output, Value::Bool(current), now, None)?;
                return Ok(());
            }
            Some(c) => c,
        };

        if current == committed {
            // Back at the committed state; abandon any pending flip.
            self.state.candidate = None;
            self.state.candidate_since = None;
            return Ok(());
        }

        match (self.state.candidate, self.state.candidate_since) {
            (Some(candidate), Some(since)) if candidate == current => {
                if elapsed_secs(since, now) >= stability_time_secs {
                    self.state.committed = Some(current);
                    self.state.candidate = None;
                    self.state.candidate_since = None;
                    store.write_or_add(&self.config.output, Value::Bool(current), now, None)?;
                }
            }
            _ => {
                // New candidate state; start (or restart) the timer.
                self.state.candidate = Some(current);
                self.state.candidate_since = Some(now);
            }
        }
        Ok(())
    }
}

impl Block for DeadbandBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        match self.config.mode {
            DeadbandMode::Digital {
                stability_time_secs,
            } => self.execute_digital(store, now, stability_time_secs),
            _ => self.execute_analog(store, now),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "DEADBAND"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = DeadbandState::default();
        Ok(())
    }
}
