// src/blocks/totalizer.rs - Accumulating totalizer block
use super::{elapsed_secs, Block};
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalizerMode {
    /// Trapezoidal integration of a rate signal over time.
    RateIntegration,
    /// Count rising edges of a digital input.
    EventCountRising,
    /// Count falling edges of a digital input.
    EventCountFalling,
    /// Count both edge directions.
    EventCountBoth,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "snake_case")]
pub enum ResetSchedule {
    /// Reset once per civil day at the given time.
    Daily { hour: u32, minute: u32 },
    /// Reset every fixed number of seconds.
    Interval { secs: f64 },
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalizerConfig {
    pub input: SourceRef,
    pub output: SourceRef,
    pub mode: TotalizerMode,
    /// Multiplier applied to each increment, e.g. unit conversion.
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    /// Accumulator wraps back to zero past this value.
    #[serde(default)]
    pub overflow_limit: Option<f64>,
    /// Rising edge on this input resets the accumulator.
    #[serde(default)]
    pub reset_input: Option<SourceRef>,
    #[serde(default)]
    pub reset_schedule: Option<ResetSchedule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TotalizerState {
    accumulated_value: f64,
    last_reset_time: Option<DateTime<Utc>>,
    /// Previous rate sample and its timestamp, for trapezoidal integration.
    last_sample: Option<(DateTime<Utc>, f64)>,
    /// Previous digital level for edge counting. None until first observation.
    last_level: Option<bool>,
    last_reset_level: Option<bool>,
}

pub struct TotalizerBlock {
    name: String,
    config: TotalizerConfig,
    state: TotalizerState,
}

impl TotalizerBlock {
    pub fn new(name: &str, config: &TotalizerConfig) -> Result<Self> {
        if let Some(limit) = config.overflow_limit {
            if limit <= 0.0 {
                return Err(EngineError::Config(format!(
                    "totalizer block '{}': overflow_limit must be positive",
                    name
                )));
            }
        }
        if let Some(ResetSchedule::Daily { hour, minute }) = config.reset_schedule {
            if hour > 23 || minute > 59 {
                return Err(EngineError::Config(format!(
                    "totalizer block '{}': invalid daily reset time {}:{}",
                    name, hour, minute
                )));
            }
        }
        if let Some(ResetSchedule::Interval { secs }) = config.reset_schedule {
            if secs <= 0.0 {
                return Err(EngineError::Config(format!(
                    "totalizer block '{}': reset interval must be positive",
                    name
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: TotalizerState::default(),
        })
    }

    pub fn total(&self) -> f64 {
        self.state.accumulated_value
    }

    fn clear_total(&mut self, now: DateTime<Utc>, reason: &str) {
        info!(
            block = %self.name,
            total = self.state.accumulated_value,
            reason,
            "totalizer reset"
        );
        self.state.accumulated_value = 0.0;
        self.state.last_reset_time = Some(now);
    }

    fn scheduled_reset_due(&self, now: DateTime<Utc>) -> bool {
        let last = match self.state.last_reset_time {
            Some(t) => t,
            // The first tick anchors the schedule without resetting.
            None => return false,
        };
        match self.config.reset_schedule {
            Some(ResetSchedule::Interval { secs }) => elapsed_secs(last, now) >= secs,
            Some(ResetSchedule::Daily { hour, minute }) => {
                // Due once the configured time of day has been crossed since
                // the last reset.
                let mut due = last
                    .date_naive()
                    .and_hms_opt(hour, minute, 0)
                    .map(|t| t.and_utc())
                    .unwrap_or(last);
                if due <= last {
                    due += chrono::Duration::days(1);
                }
                now >= due
            }
            None => false,
        }
    }

    fn accumulate(&mut self, sample: TotalizerSample, now: DateTime<Utc>) {
        match sample {
            TotalizerSample::Rate(rate) => {
                if !rate.is_finite() {
                    return;
                }
                if let Some((last_ts, last_rate)) = self.state.last_sample {
                    let dt = elapsed_secs(last_ts, now);
                    let increment = (last_rate + rate) / 2.0 * dt;
                    self.state.accumulated_value += increment * self.config.scale_factor;
                }
                self.state.last_sample = Some((now, rate));
            }
            TotalizerSample::Level(level) => {
                if let Some(prev) = self.state.last_level {
                    let counted = match self.config.mode {
                        TotalizerMode::EventCountRising => !prev && level,
                        TotalizerMode::EventCountFalling => prev && !level,
                        TotalizerMode::EventCountBoth => prev != level,
                        TotalizerMode::RateIntegration => unreachable!(),
                    };
                    if counted {
                        self.state.accumulated_value += self.config.scale_factor;
                    }
                }
                self.state.last_level = Some(level);
            }
        }
    }
}

/// Pre-read input for one tick, fetched before any state changes.
enum TotalizerSample {
    Rate(f64),
    Level(bool),
}

impl Block for TotalizerBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        // All store reads come first so a failed tick leaves the running
        // total untouched.
        let reset_level = match &self.config.reset_input {
            Some(reset_input) => Some(store.get_bool(reset_input)?),
            None => None,
        };
        let sample = match self.config.mode {
            TotalizerMode::RateIntegration => {
                TotalizerSample::Rate(store.get_float(&self.config.input)?)
            }
            _ => TotalizerSample::Level(store.get_bool(&self.config.input)?),
        };

        if self.state.last_reset_time.is_none() {
            self.state.last_reset_time = Some(now);
        }
        if let Some(level) = reset_level {
            let rising = self.state.last_reset_level == Some(false) && level;
            self.state.last_reset_level = Some(level);
            if rising {
                self.clear_total(now, "reset input");
            }
        }
        if self.scheduled_reset_due(now) {
            self.clear_total(now, "schedule");
        }

        self.accumulate(sample, now);

        if let Some(limit) = self.config.overflow_limit {
            if self.state.accumulated_value >= limit {
                self.state.accumulated_value -= limit;
                self.state.last_reset_time = Some(now);
                info!(block = %self.name, limit, "totalizer overflow wrap");
            }
        }

        store.write_or_add(
            &self.config.output,
            Value::Float(self.state.accumulated_value),
            now,
            None,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "TOTALIZER"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = TotalizerState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_config(mode: TotalizerMode) -> TotalizerConfig {
        TotalizerConfig {
            input: SourceRef::Point("in".into()),
            output: SourceRef::Point("total".into()),
            mode,
            scale_factor: 1.0,
            overflow_limit: None,
            reset_input: None,
            reset_schedule: None,
        }
    }

    #[test]
    fn test_trapezoidal_integration() {
        let store = PointStore::new();
        let config = base_config(TotalizerMode::RateIntegration);
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        store.write_or_add(&input, Value::Float(5.0), t0, None).unwrap();
        block.execute(&store, t0).unwrap();
        assert_eq!(block.total(), 0.0);

        // 5 -> 15 over one second adds (5+15)/2 * 1 = 10
        let t1 = t0 + chrono::Duration::seconds(1);
        store.write_or_add(&input, Value::Float(15.0), t1, None).unwrap();
        block.execute(&store, t1).unwrap();
        assert!((block.total() - 10.0).abs() < 1e-9);
        assert_eq!(
            store.get_float(&SourceRef::Point("total".into())).unwrap(),
            block.total()
        );
    }

    #[test]
    fn test_rising_edge_count() {
        let store = PointStore::new();
        let config = base_config(TotalizerMode::EventCountRising);
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let mut now = Utc::now();

        for level in [true, false, true, true, false, true] {
            now += chrono::Duration::seconds(1);
            store.write_or_add(&input, Value::Bool(level), now, None).unwrap();
            block.execute(&store, now).unwrap();
        }
        // First observation is a baseline, then two rising edges follow.
        assert_eq!(block.total(), 2.0);
    }

    #[test]
    fn test_both_edges_with_scale() {
        let store = PointStore::new();
        let mut config = base_config(TotalizerMode::EventCountBoth);
        config.scale_factor = 0.5;
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let mut now = Utc::now();

        for level in [false, true, false, true] {
            now += chrono::Duration::seconds(1);
            store.write_or_add(&input, Value::Bool(level), now, None).unwrap();
            block.execute(&store, now).unwrap();
        }
        assert_eq!(block.total(), 1.5);
    }

    #[test]
    fn test_overflow_wraps() {
        let store = PointStore::new();
        let mut config = base_config(TotalizerMode::EventCountRising);
        config.overflow_limit = Some(3.0);
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let mut now = Utc::now();

        store.write_or_add(&input, Value::Bool(false), now, None).unwrap();
        block.execute(&store, now).unwrap();
        for _ in 0..4 {
            for level in [true, false] {
                now += chrono::Duration::seconds(1);
                store.write_or_add(&input, Value::Bool(level), now, None).unwrap();
                block.execute(&store, now).unwrap();
            }
        }
        // Four edges against a limit of three leaves one after the wrap.
        assert_eq!(block.total(), 1.0);
    }

    #[test]
    fn test_reset_input_rising_edge() {
        let store = PointStore::new();
        let mut config = base_config(TotalizerMode::RateIntegration);
        config.reset_input = Some(SourceRef::Point("reset".into()));
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let reset = SourceRef::Point("reset".into());
        let mut now = Utc::now();

        store.write_or_add(&reset, Value::Bool(false), now, None).unwrap();
        for _ in 0..3 {
            now += chrono::Duration::seconds(1);
            store.write_or_add(&input, Value::Float(10.0), now, None).unwrap();
            block.execute(&store, now).unwrap();
        }
        assert!(block.total() > 0.0);

        now += chrono::Duration::seconds(1);
        store.write_or_add(&reset, Value::Bool(true), now, None).unwrap();
        store.write_or_add(&input, Value::Float(10.0), now, None).unwrap();
        block.execute(&store, now).unwrap();
        // Reset happens before this tick's increment is added
        assert!((block.total() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_read_leaves_total_and_reset_edge_intact() {
        let store = PointStore::new();
        let mut config = base_config(TotalizerMode::EventCountRising);
        config.reset_input = Some(SourceRef::Point("reset".into()));
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());
        let reset = SourceRef::Point("reset".into());
        let mut now = Utc::now();

        store.write_or_add(&reset, Value::Bool(false), now, None).unwrap();
        store.write_or_add(&input, Value::Bool(false), now, None).unwrap();
        block.execute(&store, now).unwrap();
        now += chrono::Duration::seconds(1);
        store.write_or_add(&input, Value::Bool(true), now, None).unwrap();
        block.execute(&store, now).unwrap();
        assert_eq!(block.total(), 1.0);

        // The main input turns unreadable on the same tick the reset edge
        // arrives; the errored tick must not touch the total or consume
        // the edge.
        now += chrono::Duration::seconds(1);
        store.write_or_add(&reset, Value::Bool(true), now, None).unwrap();
        store.write_or_add(&input, Value::Float(f64::NAN), now, None).unwrap();
        assert!(block.execute(&store, now).is_err());
        assert_eq!(block.total(), 1.0);

        // Once the input recovers the pending rising edge still resets
        now += chrono::Duration::seconds(1);
        store.write_or_add(&input, Value::Bool(true), now, None).unwrap();
        block.execute(&store, now).unwrap();
        assert_eq!(block.total(), 0.0);
    }

    #[test]
    fn test_daily_scheduled_reset() {
        let store = PointStore::new();
        let mut config = base_config(TotalizerMode::RateIntegration);
        config.reset_schedule = Some(ResetSchedule::Daily { hour: 0, minute: 0 });
        let mut block = TotalizerBlock::new("tot", &config).unwrap();
        let input = SourceRef::Point("in".into());

        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 23, 59, 0).unwrap();
        store.write_or_add(&input, Value::Float(6.0), t0, None).unwrap();
        block.execute(&store, t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        store.write_or_add(&input, Value::Float(6.0), t1, None).unwrap();
        block.execute(&store, t1).unwrap();
        assert!(block.total() > 0.0);

        // Crossing midnight zeroes the accumulator
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 30).unwrap();
        store.write_or_add(&input, Value::Float(6.0), t2, None).unwrap();
        block.execute(&store, t2).unwrap();
        // One 60s trapezoid at a constant rate of 6.0 after the reset
        assert!((block.total() - 6.0 * 60.0).abs() < 1e-6);
        assert_eq!(block.state.last_reset_time, Some(t2));
    }
}
