// src/blocks/schedule.rs - Time-of-week scheduler block
use super::Block;
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    fn matches(&self, weekday: Weekday) -> bool {
        matches!(
            (self, weekday),
            (DayOfWeek::Monday, Weekday::Mon)
                | (DayOfWeek::Tuesday, Weekday::Tue)
                | (DayOfWeek::Wednesday, Weekday::Wed)
                | (DayOfWeek::Thursday, Weekday::Thu)
                | (DayOfWeek::Friday, Weekday::Fri)
                | (DayOfWeek::Saturday, Weekday::Sat)
                | (DayOfWeek::Sunday, Weekday::Sun)
        )
    }
}

/// How an entry with no end time behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NullEndPolicy {
    /// The entry stays active until the end of its day.
    #[default]
    ExtendToEndOfDay,
    /// The entry is skipped; the schedule falls through to the default.
    UseDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub days: Vec<DayOfWeek>,
    pub start: NaiveTime,
    /// Open end. An entry whose end precedes its start wraps past midnight.
    #[serde(default)]
    pub end: Option<NaiveTime>,
    /// Higher priorities win when entries overlap.
    #[serde(default)]
    pub priority: u8,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolidayConfig {
    pub dates: Vec<NaiveDate>,
    /// Value emitted on holidays. Falls back to the schedule default.
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub output: SourceRef,
    pub entries: Vec<ScheduleEntry>,
    /// Emitted when no entry is active.
    pub default_value: Value,
    #[serde(default)]
    pub null_end_policy: NullEndPolicy,
    #[serde(default)]
    pub holidays: Option<HolidayConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum OverrideState {
    #[default]
    None,
    /// Expires at a fixed instant.
    Timed { value: Value, until: DateTime<Utc> },
    /// Expires when the winning entry changes.
    UntilChange {
        value: Value,
        baseline: Option<usize>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleState {
    #[serde(default)]
    override_state: OverrideState,
    active_entry: Option<usize>,
}

pub struct ScheduleBlock {
    name: String,
    config: ScheduleConfig,
    state: ScheduleState,
}

impl ScheduleBlock {
    pub fn new(name: &str, config: &ScheduleConfig) -> Result<Self> {
        if config.entries.is_empty() {
            return Err(EngineError::Config(format!(
                "schedule block '{}': at least one entry required",
                name
            )));
        }
        for (i, entry) in config.entries.iter().enumerate() {
            if entry.days.is_empty() {
                return Err(EngineError::Config(format!(
                    "schedule block '{}': entry {} has no days",
                    name, i
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: ScheduleState::default(),
        })
    }

    /// Force the output to `value` for `minutes` minutes.
    pub fn set_override(&mut self, value: Value, minutes: f64, now: DateTime<Utc>) {
        debug!(block = %self.name, %value, minutes, "timed override set");
        self.state.override_state = OverrideState::Timed {
            value,
            until: now + chrono::Duration::milliseconds((minutes * 60_000.0) as i64),
        };
    }

    /// Force the output to `value` until the winning entry next changes.
    pub fn set_override_until_change(&mut self, value: Value) {
        debug!(block = %self.name, %value, "event override set");
        self.state.override_state = OverrideState::UntilChange {
            value,
            baseline: self.state.active_entry,
        };
    }

    pub fn clear_override(&mut self) {
        self.state.override_state = OverrideState::None;
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.config
            .holidays
            .as_ref()
            .map(|h| h.dates.contains(&date))
            .unwrap_or(false)
    }

    fn entry_active(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> bool {
        let time = now.time();
        let today = now.weekday();
        match entry.end {
            Some(end) if end < entry.start => {
                // Wraps past midnight. The post-midnight tail belongs to the
                // entry anchored on the previous day.
                let yesterday = today.pred();
                (entry.days.iter().any(|d| d.matches(today)) && time >= entry.start)
                    || (entry.days.iter().any(|d| d.matches(yesterday)) && time < end)
            }
            Some(end) => {
                entry.days.iter().any(|d| d.matches(today))
                    && time >= entry.start
                    && time < end
            }
            None => match self.config.null_end_policy {
                NullEndPolicy::ExtendToEndOfDay => {
                    entry.days.iter().any(|d| d.matches(today)) && time >= entry.start
                }
                NullEndPolicy::UseDefault => false,
            },
        }
    }

    /// Index of the winning entry, highest priority first, earlier
    /// configuration order breaking ties.
    fn winner(&self, now: DateTime<Utc>) -> Option<usize> {
        if self.is_holiday(now.date_naive()) {
            return None;
        }
        self.config
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| self.entry_active(e, now))
            .max_by_key(|(i, e)| (e.priority, std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }

    fn scheduled_value(&self, winner: Option<usize>, now: DateTime<Utc>) -> Value {
        if let Some(i) = winner {
            return self.config.entries[i].value.clone();
        }
        if self.is_holiday(now.date_naive()) {
            if let Some(v) = self.config.holidays.as_ref().and_then(|h| h.value.clone()) {
                return v;
            }
        }
        self.config.default_value.clone()
    }
}

impl Block for ScheduleBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let winner = self.winner(now);

        let expired = match &self.state.override_state {
            OverrideState::None => false,
            OverrideState::Timed { until, .. } => now >= *until,
            OverrideState::UntilChange { baseline, .. } => winner != *baseline,
        };
        if expired {
            debug!(block = %self.name, "override expired");
            self.state.override_state = OverrideState::None;
        }

        let value = match &self.state.override_state {
            OverrideState::Timed { value, .. } | OverrideState::UntilChange { value, .. } => {
                value.clone()
            }
            OverrideState::None => self.scheduled_value(winner, now),
        };
        self.state.active_entry = winner;

        store.write_or_add(&self.config.output, value, now, None)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "SCHEDULE"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = ScheduleState::default();
        Ok(())
    }
}
