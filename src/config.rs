// src/config.rs - Configuration structures and YAML loading
use crate::{
    alarms::AlarmConfig,
    blocks::{
        action::{TimeoutConfig, WriteActionConfig},
        average::AverageConfig,
        deadband::DeadbandConfig,
        formula::{FormulaConfig, IfConfig},
        pid::PidConfig,
        rate::RateConfig,
        schedule::ScheduleConfig,
        selector::MinMaxConfig,
        statistics::StatisticsConfig,
        totalizer::TotalizerConfig,
        voting::VotingConfig,
    },
    error::{EngineError, Result},
    point::{PointType, VariableType},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Comparison operators shared by voting groups, branch conditions and
/// comparative alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equal,
    NotEqual,
    Higher,
    Lower,
    Between,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub points: Vec<PointConfig>,

    #[serde(default)]
    pub variables: Vec<VariableConfig>,

    #[serde(default)]
    pub blocks: Vec<BlockConfig>,

    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
}

fn default_base_resolution() -> u64 {
    100
}
fn default_alarm_interval() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler tick resolution in milliseconds.
    #[serde(default = "default_base_resolution")]
    pub base_resolution_ms: u64,

    /// Evaluation interval for alarms in seconds.
    #[serde(default = "default_alarm_interval")]
    pub alarm_interval_secs: f64,

    /// Runtime state snapshots are persisted under this directory when set.
    #[serde(default)]
    pub state_dir: Option<std::path::PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_resolution_ms: default_base_resolution(),
            alarm_interval_secs: default_alarm_interval(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    pub id: String,
    pub point_type: PointType,
    #[serde(default)]
    pub description: String,
    /// Value seeded into the store at startup.
    #[serde(default)]
    pub initial: Option<Value>,
    /// Field-side scaling; raw values are `scale * x + offset` in
    /// engineering units. Applied by the I/O layer feeding the store.
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub id: String,
    pub variable_type: VariableType,
    #[serde(default)]
    pub initial: Option<Value>,
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Evaluation interval in seconds, independent per block.
    #[serde(default = "default_interval")]
    pub interval_secs: f64,
    /// Disabled blocks keep their schedule slot but never evaluate.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub params: BlockParams,
}

/// Typed per-block parameters, dispatched on the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockParams {
    Average(AverageConfig),
    Voting(VotingConfig),
    Deadband(DeadbandConfig),
    RateOfChange(RateConfig),
    Statistics(StatisticsConfig),
    Totalizer(TotalizerConfig),
    Schedule(ScheduleConfig),
    Formula(FormulaConfig),
    If(IfConfig),
    MinMax(MinMaxConfig),
    WriteAction(WriteActionConfig),
    Timeout(TimeoutConfig),
    Pid(PidConfig),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.base_resolution_ms == 0 {
            return Err(EngineError::Config(
                "engine.base_resolution_ms must be positive".into(),
            ));
        }
        if self.engine.alarm_interval_secs <= 0.0 {
            return Err(EngineError::Config(
                "engine.alarm_interval_secs must be positive".into(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for p in &self.points {
            if !ids.insert(p.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate point id '{}'", p.id)));
            }
        }
        let mut ids = std::collections::HashSet::new();
        for v in &self.variables {
            if !ids.insert(v.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate variable id '{}'",
                    v.id
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for b in &self.blocks {
            if b.name.is_empty() {
                return Err(EngineError::Config("block with empty name".into()));
            }
            if !names.insert(b.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate block name '{}'",
                    b.name
                )));
            }
            if b.interval_secs <= 0.0 {
                return Err(EngineError::Config(format!(
                    "block '{}': interval_secs must be positive",
                    b.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
engine:
  base_resolution_ms: 100

points:
  - id: zone_temp_1
    point_type: analog_input
  - id: zone_temp_2
    point_type: analog_input
  - id: avg_temp
    point_type: analog_output

blocks:
  - name: zone_average
    type: average
    interval_secs: 5.0
    inputs:
      - point: zone_temp_1
      - point: zone_temp_2
    output:
      point: avg_temp
    algorithm: simple
    window_size: 10

alarms:
  - name: zone_hot
    priority: critical
    condition:
      kind: compare
      value1:
        point: avg_temp
      op: higher
      value2: 28.0
      hysteresis: 0.5
    message: zone overheating
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.engine.base_resolution_ms, 100);
        assert_eq!(config.points.len(), 3);
        assert_eq!(config.blocks.len(), 1);
        assert_eq!(config.alarms.len(), 1);
        assert!(config.blocks[0].enabled);
        assert!(matches!(config.blocks[0].params, BlockParams::Average(_)));
    }

    #[test]
    fn test_duplicate_block_names_rejected() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        let dup = config.blocks[0].clone();
        config.blocks.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.blocks[0].interval_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_block_type_fails() {
        let yaml = r#"
blocks:
  - name: mystery
    type: quantum_flux
    interval_secs: 1.0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}
