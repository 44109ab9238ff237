// src/blocks/voting.rs - N-out-of-M comparison/voting block
use super::Block;
use crate::{
    config::CompareOp,
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    #[default]
    And,
    Or,
    Xor,
}

/// Comparator applied to each input of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Comparison {
    Analog {
        op: CompareOp,
        threshold: f64,
        /// Upper bound for `Between`.
        #[serde(default)]
        threshold2: Option<f64>,
        #[serde(default)]
        hysteresis: f64,
    },
    Digital { target: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteGroup {
    pub inputs: Vec<SourceRef>,
    pub required_votes: usize,
    /// Two-point vote hysteresis: the group turns ON at
    /// `required_votes + hysteresis` satisfied inputs and OFF below
    /// `required_votes - hysteresis`; in between the previous result holds.
    #[serde(default)]
    pub voting_hysteresis: usize,
    pub comparison: Comparison,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingConfig {
    pub groups: Vec<VoteGroup>,
    #[serde(default)]
    pub combine: CombineMode,
    #[serde(default)]
    pub invert: bool,
    pub output: SourceRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VotingState {
    /// Per-group, per-input comparison latches (threshold hysteresis).
    input_latches: Vec<Vec<bool>>,
    /// Per-group vote result latches (voting hysteresis).
    group_latches: Vec<bool>,
}

pub struct VotingBlock {
    name: String,
    config: VotingConfig,
    state: VotingState,
}

/// Two-point comparison with a `±hysteresis` band around the threshold(s):
/// the result flips only outside the band and retains `prev` inside it.
pub(crate) fn compare_with_hysteresis(
    op: CompareOp,
    value: f64,
    threshold: f64,
    threshold2: f64,
    hysteresis: f64,
    prev: bool,
) -> bool {
    let h = hysteresis.abs();
    match op {
        CompareOp::Equal => (value - threshold).abs() <= h,
        CompareOp::NotEqual => (value - threshold).abs() > h,
        CompareOp::Higher => {
            if value > threshold + h {
                true
            } else if value < threshold - h {
                false
            } else {
                prev
            }
        }
        CompareOp::Lower => {
            if value < threshold - h {
                true
            } else if value > threshold + h {
                false
            } else {
                prev
            }
        }
        CompareOp::Between => {
            let (lo, hi) = (threshold.min(threshold2), threshold.max(threshold2));
            if value >= lo + h && value <= hi - h {
                true
            } else if value < lo - h || value > hi + h {
                false
            } else {
                prev
            }
        }
    }
}

impl VotingBlock {
    pub fn new(name: &str, config: &VotingConfig) -> Result<Self> {
        if config.groups.is_empty() {
            return Err(EngineError::Config(format!(
                "voting block '{}' requires at least one group",
                name
            )));
        }
        for (i, group) in config.groups.iter().enumerate() {
            if group.inputs.is_empty() {
                return Err(EngineError::Config(format!(
                    "voting block '{}' group {}: no inputs",
                    name, i
                )));
            }
            if group.required_votes < 1 || group.required_votes > group.inputs.len() {
                return Err(EngineError::Config(format!(
                    "voting block '{}' group {}: required_votes must be 1-{}",
                    name,
                    i,
                    group.inputs.len()
                )));
            }
            if let Comparison::Analog {
                op: CompareOp::Between,
                threshold2: None,
                ..
            } = group.comparison
            {
                return Err(EngineError::Config(format!(
                    "voting block '{}' group {}: 'between' requires threshold2",
                    name, i
                )));
            }
        }
        let state = VotingState {
            input_latches: config.groups.iter().map(|g| vec![false; g.inputs.len()]).collect(),
            group_latches: vec![false; config.groups.len()],
        };
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state,
        })
    }

    /// Evaluate one group against the previous latches, returning the new
    /// latches without touching them.
    fn evaluate_group(
        group: &VoteGroup,
        input_latches: &[bool],
        group_latch: bool,
        store: &PointStore,
    ) -> Result<(Vec<bool>, bool)> {
        let mut latches = Vec::with_capacity(group.inputs.len());
        let mut satisfied = 0usize;
        for (i, input) in group.inputs.iter().enumerate() {
            let result = match &group.comparison {
                Comparison::Analog {
                    op,
                    threshold,
                    threshold2,
                    hysteresis,
                } => {
                    let v = store.get_float(input)?;
                    compare_with_hysteresis(
                        *op,
                        v,
                        *threshold,
                        threshold2.unwrap_or(*threshold),
                        *hysteresis,
                        input_latches[i],
                    )
                }
                Comparison::Digital { target } => store.get_bool(input)? == *target,
            };
            latches.push(result);
            if result {
                satisfied += 1;
            }
        }

        let h = group.voting_hysteresis;
        let on_at = (group.required_votes + h).min(group.inputs.len());
        let latch = if satisfied >= on_at {
            true
        } else if satisfied < group.required_votes.saturating_sub(h) {
            false
        } else {
            // Between the two thresholds the previous result is retained.
            group_latch
        };
        Ok((latches, latch))
    }
}

impl Block for VotingBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        // Stage every group before committing so an errored tick leaves all
        // latches unchanged.
        let mut input_latches = Vec::with_capacity(self.config.groups.len());
        let mut group_latches = Vec::with_capacity(self.config.groups.len());
        for (i, group) in self.config.groups.iter().enumerate() {
            let (latches, latch) = Self::evaluate_group(
                group,
                &self.state.input_latches[i],
                self.state.group_latches[i],
                store,
            )?;
            input_latches.push(latches);
            group_latches.push(latch);
        }
        self.state.input_latches = input_latches;
        self.state.group_latches = group_latches;

        let votes = &self.state.group_latches;
        let combined = match self.config.combine {
            CombineMode::And => votes.iter().all(|v| *v),
            CombineMode::Or => votes.iter().any(|v| *v),
            CombineMode::Xor => votes.iter().filter(|v| **v).count() == 1,
        };
        let result = combined != self.config.invert;

        store.write_or_add(&self.config.output, Value::Bool(result), now, None)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "VOTING"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        let restored: VotingState = serde_json::from_value(state)?;
        // Shape must match the current configuration; otherwise start clean.
        if restored.group_latches.len() == self.config.groups.len()
            && restored
                .input_latches
                .iter()
                .zip(&self.config.groups)
                .all(|(l, g)| l.len() == g.inputs.len())
        {
            self.state = restored;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        for latches in &mut self.state.input_latches {
            latches.iter_mut().for_each(|l| *l = false);
        }
        self.state.group_latches.iter_mut().for_each(|l| *l = false);
        Ok(())
    }
}
