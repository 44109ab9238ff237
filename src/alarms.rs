// src/alarms.rs - Alarm evaluation, active table and bounded history
use crate::{
    blocks::voting::compare_with_hysteresis,
    config::CompareOp,
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPriority {
    Warning,
    Critical,
}

/// Right hand side of a comparison, fixed or read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Fixed(f64),
    Source(SourceRef),
}

impl Operand {
    fn resolve(&self, store: &PointStore) -> Result<f64> {
        match self {
            Operand::Fixed(v) => Ok(*v),
            Operand::Source(s) => store.get_float(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlarmCondition {
    /// Compares a monitored value against an operand with hysteresis.
    Compare {
        value1: SourceRef,
        op: CompareOp,
        value2: Operand,
        #[serde(default)]
        value2_upper: Option<Operand>,
        #[serde(default)]
        hysteresis: f64,
    },
    /// Raised while the monitored entry is older than the timeout.
    Timeout {
        input: SourceRef,
        timeout_secs: f64,
    },
}

impl AlarmCondition {
    fn item(&self) -> &SourceRef {
        match self {
            AlarmCondition::Compare { value1, .. } => value1,
            AlarmCondition::Timeout { input, .. } => input,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_external_value() -> bool {
    true
}

/// Auxiliary output driven by an alarm, a horn or beacon target plus the
/// boolean written on activation. The inverse is written on clearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAlarm {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub target: SourceRef,
    #[serde(default = "default_external_value")]
    pub value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub priority: AlarmPriority,
    pub condition: AlarmCondition,
    /// The condition must hold this long before the alarm raises.
    #[serde(default)]
    pub delay_secs: f64,
    pub message: String,
    /// Message recorded when the alarm clears. Falls back to `message`.
    #[serde(default)]
    pub message_alt: Option<String>,
    /// Digital outputs driven by the alarm state.
    #[serde(default)]
    pub external: Vec<ExternalAlarm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlarm {
    pub id: Uuid,
    pub alarm: String,
    /// Identifier of the monitored source.
    pub item: String,
    pub priority: AlarmPriority,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmEventKind {
    Raised,
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: Uuid,
    pub alarm: String,
    pub item: String,
    pub priority: AlarmPriority,
    pub kind: AlarmEventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AlarmState {
    raised: bool,
    /// Hysteresis latch of the raw condition, independent of the delay.
    latch: bool,
    pending_since: Option<DateTime<Utc>>,
    active_id: Option<Uuid>,
}

struct Evaluator {
    config: AlarmConfig,
    state: AlarmState,
}

/// Evaluates configured alarms against the store and maintains the active
/// table plus a bounded append-only event history.
pub struct AlarmManager {
    evaluators: Vec<Evaluator>,
    active: Vec<ActiveAlarm>,
    history: VecDeque<AlarmEvent>,
    history_capacity: usize,
}

impl AlarmManager {
    pub fn new(configs: &[AlarmConfig]) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for c in configs {
            if !seen.insert(c.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate alarm name '{}'",
                    c.name
                )));
            }
            if c.delay_secs < 0.0 {
                return Err(EngineError::Config(format!(
                    "alarm '{}': delay_secs must not be negative",
                    c.name
                )));
            }
        }
        Ok(Self {
            evaluators: configs
                .iter()
                .map(|c| Evaluator {
                    config: c.clone(),
                    state: AlarmState::default(),
                })
                .collect(),
            active: Vec::new(),
            history: VecDeque::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        })
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn alarm_count(&self) -> usize {
        self.evaluators.len()
    }

    pub fn alarm_names(&self) -> Vec<&str> {
        self.evaluators.iter().map(|e| e.config.name.as_str()).collect()
    }

    /// Evaluate every enabled alarm.
    pub fn evaluate(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        for i in 0..self.evaluators.len() {
            self.evaluate_at(i, store, now)?;
        }
        Ok(())
    }

    /// Evaluate the alarm at `index`. Disabled alarms are skipped whole,
    /// including their pending timers.
    pub fn evaluate_at(
        &mut self,
        index: usize,
        store: &PointStore,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let evaluator = match self.evaluators.get_mut(index) {
            Some(e) => e,
            None => {
                return Err(EngineError::Runtime(format!(
                    "alarm index {} out of range",
                    index
                )))
            }
        };
        if !evaluator.config.enabled {
            return Ok(());
        }

        let raw = match &evaluator.config.condition {
            AlarmCondition::Compare {
                value1,
                op,
                value2,
                value2_upper,
                hysteresis,
            } => {
                let v = store.get_float(value1)?;
                let threshold = value2.resolve(store)?;
                let threshold2 = match value2_upper {
                    Some(u) => u.resolve(store)?,
                    None => 0.0,
                };
                compare_with_hysteresis(
                    *op,
                    v,
                    threshold,
                    threshold2,
                    *hysteresis,
                    evaluator.state.latch,
                )
            }
            AlarmCondition::Timeout {
                input,
                timeout_secs,
            } => match store.age_secs(input, now) {
                Ok(age) => age > *timeout_secs,
                Err(_) => true,
            },
        };
        evaluator.state.latch = raw;

        if raw && !evaluator.state.raised {
            let since = *evaluator.state.pending_since.get_or_insert(now);
            let held = (now - since).num_milliseconds() as f64 / 1000.0;
            if held >= evaluator.config.delay_secs {
                let event = Self::transition(evaluator, AlarmEventKind::Raised, now);
                self.active.push(ActiveAlarm {
                    id: event.id,
                    alarm: event.alarm.clone(),
                    item: event.item.clone(),
                    priority: event.priority,
                    message: event.message.clone(),
                    raised_at: now,
                });
                self.push_history(event);
                let targets = self.evaluators[index].config.external.clone();
                Self::fan_out(&targets, store, true, now)?;
            }
        } else if !raw {
            evaluator.state.pending_since = None;
            if evaluator.state.raised {
                let event = Self::transition(evaluator, AlarmEventKind::Cleared, now);
                self.active.retain(|a| a.id != event.id);
                self.push_history(event);
                let targets = self.evaluators[index].config.external.clone();
                Self::fan_out(&targets, store, false, now)?;
            }
        }
        Ok(())
    }

    fn transition(evaluator: &mut Evaluator, kind: AlarmEventKind, now: DateTime<Utc>) -> AlarmEvent {
        let config = &evaluator.config;
        let (id, message) = match kind {
            AlarmEventKind::Raised => {
                let id = Uuid::new_v4();
                evaluator.state.raised = true;
                evaluator.state.pending_since = None;
                evaluator.state.active_id = Some(id);
                warn!(alarm = %config.name, priority = ?config.priority, "alarm raised");
                (id, config.message.clone())
            }
            AlarmEventKind::Cleared => {
                let id = evaluator.state.active_id.take().unwrap_or_else(Uuid::new_v4);
                evaluator.state.raised = false;
                info!(alarm = %config.name, "alarm cleared");
                (
                    id,
                    config.message_alt.clone().unwrap_or_else(|| config.message.clone()),
                )
            }
        };
        AlarmEvent {
            id,
            alarm: config.name.clone(),
            item: config.condition.item().id().to_string(),
            priority: config.priority,
            kind,
            message,
            timestamp: now,
            annotation: None,
        }
    }

    fn fan_out(
        targets: &[ExternalAlarm],
        store: &PointStore,
        raised: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for ext in targets {
            let value = if raised { ext.value } else { !ext.value };
            store.write_or_add(&ext.target, Value::Bool(value), now, None)?;
        }
        Ok(())
    }

    fn push_history(&mut self, event: AlarmEvent) {
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    pub fn active_alarms(&self) -> &[ActiveAlarm] {
        &self.active
    }

    pub fn is_active(&self, alarm: &str) -> bool {
        self.active.iter().any(|a| a.alarm == alarm)
    }

    pub fn active_for_item<'a>(&'a self, item: &'a str) -> impl Iterator<Item = &'a ActiveAlarm> {
        self.active.iter().filter(move |a| a.item == item)
    }

    pub fn history(&self) -> impl Iterator<Item = &AlarmEvent> {
        self.history.iter()
    }

    pub fn history_for_alarm<'a>(&'a self, alarm: &'a str) -> impl Iterator<Item = &'a AlarmEvent> {
        self.history.iter().filter(move |e| e.alarm == alarm)
    }

    pub fn history_for_item<'a>(&'a self, item: &'a str) -> impl Iterator<Item = &'a AlarmEvent> {
        self.history.iter().filter(move |e| e.item == item)
    }

    /// Attach an operator note to a history event.
    pub fn annotate(&mut self, id: Uuid, text: &str) -> Result<()> {
        let event = self
            .history
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EngineError::Runtime(format!("no alarm event {}", id)))?;
        event.annotation = Some(text.to_string());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<serde_json::Value> {
        let states: Vec<&AlarmState> = self.evaluators.iter().map(|e| &e.state).collect();
        Ok(serde_json::json!({
            "states": states,
            "active": self.active,
            "history": self.history,
        }))
    }

    pub fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        if let Some(states) = snapshot.get("states") {
            let states: Vec<AlarmState> = serde_json::from_value(states.clone())?;
            if states.len() == self.evaluators.len() {
                for (evaluator, state) in self.evaluators.iter_mut().zip(states) {
                    evaluator.state = state;
                }
            }
        }
        if let Some(active) = snapshot.get("active") {
            self.active = serde_json::from_value(active.clone())?;
        }
        if let Some(history) = snapshot.get("history") {
            self.history = serde_json::from_value(history.clone())?;
        }
        Ok(())
    }
}
