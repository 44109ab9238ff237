// src/blocks/action.rs - Triggered write and staleness timeout blocks
use super::Block;
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTarget {
    pub target: SourceRef,
    pub value: Value,
    /// Positive duration reserves the target against plain writes.
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteActionConfig {
    /// Digital trigger; writes fire on its rising edge.
    pub trigger: SourceRef,
    pub writes: Vec<WriteTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WriteActionState {
    last_trigger: Option<bool>,
    fire_count: u64,
}

pub struct WriteActionBlock {
    name: String,
    config: WriteActionConfig,
    state: WriteActionState,
}

impl WriteActionBlock {
    pub fn new(name: &str, config: &WriteActionConfig) -> Result<Self> {
        if config.writes.is_empty() {
            return Err(EngineError::Config(format!(
                "write action block '{}': at least one write required",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: WriteActionState::default(),
        })
    }
}

impl Block for WriteActionBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let level = store.get_bool(&self.config.trigger)?;
        let rising = self.state.last_trigger == Some(false) && level;
        self.state.last_trigger = Some(level);
        if !rising {
            return Ok(());
        }

        self.state.fire_count += 1;
        debug!(block = %self.name, count = self.state.fire_count, "trigger fired");
        for w in &self.config.writes {
            store.write_or_add(&w.target, w.value.clone(), now, w.duration_secs)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "WRITE_ACTION"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = WriteActionState::default();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub input: SourceRef,
    /// Receives `true` while the input is older than `timeout_secs`.
    pub output: SourceRef,
    pub timeout_secs: f64,
}

pub struct TimeoutBlock {
    name: String,
    config: TimeoutConfig,
    last_state: Option<bool>,
}

impl TimeoutBlock {
    pub fn new(name: &str, config: &TimeoutConfig) -> Result<Self> {
        if config.timeout_secs <= 0.0 {
            return Err(EngineError::Config(format!(
                "timeout block '{}': timeout_secs must be positive",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            last_state: None,
        })
    }
}

impl Block for TimeoutBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        // An input that was never written counts as timed out.
        let timed_out = match store.age_secs(&self.config.input, now) {
            Ok(age) => age > self.config.timeout_secs,
            Err(_) => true,
        };
        if self.last_state != Some(timed_out) {
            if timed_out {
                warn!(block = %self.name, input = %self.config.input, "input timed out");
            } else {
                debug!(block = %self.name, input = %self.config.input, "input recovered");
            }
            self.last_state = Some(timed_out);
        }
        store.write_or_add(&self.config.output, Value::Bool(timed_out), now, None)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "TIMEOUT"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "last_state": self.last_state }))
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        if let Some(s) = state.get("last_state") {
            self.last_state = serde_json::from_value(s.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_action_fires_on_rising_edge_only() {
        let store = PointStore::new();
        let trigger = SourceRef::Point("trig".into());
        let target = SourceRef::Point("cmd".into());
        let config = WriteActionConfig {
            trigger: trigger.clone(),
            writes: vec![WriteTarget {
                target: target.clone(),
                value: Value::Float(1.0),
                duration_secs: None,
            }],
        };
        let mut block = WriteActionBlock::new("act", &config).unwrap();
        let mut now = Utc::now();

        // First observation of a high level is a baseline, not an edge
        store.write_or_add(&trigger, Value::Bool(true), now, None).unwrap();
        block.execute(&store, now).unwrap();
        assert!(!store.exists(&target));

        for (level, expect_written) in [(false, false), (true, true)] {
            now += chrono::Duration::seconds(1);
            store.write_or_add(&trigger, Value::Bool(level), now, None).unwrap();
            block.execute(&store, now).unwrap();
            assert_eq!(store.exists(&target), expect_written);
        }
        assert_eq!(block.state.fire_count, 1);
    }

    #[test]
    fn test_write_action_reserves_target() {
        let store = PointStore::new();
        let trigger = SourceRef::Point("trig".into());
        let target = SourceRef::Point("cmd".into());
        let config = WriteActionConfig {
            trigger: trigger.clone(),
            writes: vec![WriteTarget {
                target: target.clone(),
                value: Value::Float(5.0),
                duration_secs: Some(60.0),
            }],
        };
        let mut block = WriteActionBlock::new("act", &config).unwrap();
        let now = Utc::now();

        store.write_or_add(&trigger, Value::Bool(false), now, None).unwrap();
        block.execute(&store, now).unwrap();
        let t1 = now + chrono::Duration::seconds(1);
        store.write_or_add(&trigger, Value::Bool(true), t1, None).unwrap();
        block.execute(&store, t1).unwrap();

        // A plain write during the reservation window is ignored
        let t2 = t1 + chrono::Duration::seconds(10);
        store.write_or_add(&target, Value::Float(0.0), t2, None).unwrap();
        assert_eq!(store.get_float(&target).unwrap(), 5.0);
    }

    #[test]
    fn test_timeout_block_tracks_staleness() {
        let store = PointStore::new();
        let input = SourceRef::Point("sensor".into());
        let output = SourceRef::Point("stale".into());
        let config = TimeoutConfig {
            input: input.clone(),
            output: output.clone(),
            timeout_secs: 30.0,
        };
        let mut block = TimeoutBlock::new("watch", &config).unwrap();
        let t0 = Utc::now();

        store.write_or_add(&input, Value::Float(1.0), t0, None).unwrap();
        block.execute(&store, t0 + chrono::Duration::seconds(10)).unwrap();
        assert!(!store.get_bool(&output).unwrap());

        block.execute(&store, t0 + chrono::Duration::seconds(31)).unwrap();
        assert!(store.get_bool(&output).unwrap());

        store
            .write_or_add(&input, Value::Float(2.0), t0 + chrono::Duration::seconds(40), None)
            .unwrap();
        block.execute(&store, t0 + chrono::Duration::seconds(41)).unwrap();
        assert!(!store.get_bool(&output).unwrap());
    }

    #[test]
    fn test_timeout_block_missing_input_is_timed_out() {
        let store = PointStore::new();
        let config = TimeoutConfig {
            input: SourceRef::Point("never".into()),
            output: SourceRef::Point("stale".into()),
            timeout_secs: 30.0,
        };
        let mut block = TimeoutBlock::new("watch", &config).unwrap();
        block.execute(&store, Utc::now()).unwrap();
        assert!(store.get_bool(&SourceRef::Point("stale".into())).unwrap());
    }
}
