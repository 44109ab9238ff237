// src/blocks/formula.rs - Expression formula and conditional branch blocks
use super::rate::round_to;
use super::voting::compare_with_hysteresis;
use super::Block;
use crate::{
    config::CompareOp,
    error::{EngineError, Result},
    expr::Expr,
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

const MAX_BRANCHES: usize = 20;

fn default_decimal_places() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaConfig {
    /// Alias to source bindings referenced as `[alias]` in the expression.
    pub inputs: HashMap<String, SourceRef>,
    pub output: SourceRef,
    pub expression: String,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u32,
}

pub struct FormulaBlock {
    name: String,
    config: FormulaConfig,
    expr: Expr,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

impl FormulaBlock {
    pub fn new(name: &str, config: &FormulaConfig) -> Result<Self> {
        let expr = Expr::parse(&config.expression).map_err(|e| {
            EngineError::Config(format!("formula block '{}': {}", name, e))
        })?;
        for r in expr.references() {
            if !config.inputs.contains_key(r) {
                return Err(EngineError::Config(format!(
                    "formula block '{}': expression references unbound input '[{}]'",
                    name, r
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            expr,
            last_error: None,
            last_success: None,
        })
    }

    fn bindings(&self, store: &PointStore) -> Result<HashMap<String, f64>> {
        let mut bindings = HashMap::with_capacity(self.config.inputs.len());
        for (alias, source) in &self.config.inputs {
            bindings.insert(alias.clone(), store.get_float(source)?);
        }
        Ok(bindings)
    }
}

impl Block for FormulaBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let result = self
            .bindings(store)
            .and_then(|bindings| self.expr.eval(&bindings));
        match result {
            Ok(value) if value.is_finite() => {
                let rounded = round_to(value, self.config.decimal_places);
                self.last_error = None;
                self.last_success = Some(now);
                store.write_or_add(&self.config.output, Value::Float(rounded), now, None)
            }
            Ok(value) => {
                // Non-finite results hold the previous output.
                self.last_error = Some(format!("expression produced {}", value));
                warn!(block = %self.name, value, "non-finite formula result");
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "FORMULA"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "last_success": self.last_success }))
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        if let Some(ts) = state.get("last_success") {
            self.last_success = serde_json::from_value(ts.clone())?;
        }
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

/// One condition of an [`IfBlock`] branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchCondition {
    /// Boolean expression over the block's input bindings.
    Expression { expression: String },
    /// Analog comparison with a two-point hysteresis latch.
    Compare {
        input: SourceRef,
        op: CompareOp,
        threshold: f64,
        #[serde(default)]
        threshold2: f64,
        #[serde(default)]
        hysteresis: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub condition: BranchCondition,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfConfig {
    /// Bindings for expression conditions.
    #[serde(default)]
    pub inputs: HashMap<String, SourceRef>,
    pub output: SourceRef,
    /// Evaluated in order; the first true branch supplies the output.
    pub branches: Vec<Branch>,
    pub default_value: Value,
    /// When true the output is clamped to a boolean.
    #[serde(default)]
    pub digital_output: bool,
}

enum CompiledCondition {
    Expression(Expr),
    Compare {
        input: SourceRef,
        op: CompareOp,
        threshold: f64,
        threshold2: f64,
        hysteresis: f64,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IfState {
    /// Hysteresis latch per branch, indexed by configuration order.
    latches: Vec<bool>,
}

pub struct IfBlock {
    name: String,
    config: IfConfig,
    conditions: Vec<CompiledCondition>,
    state: IfState,
}

impl IfBlock {
    pub fn new(name: &str, config: &IfConfig) -> Result<Self> {
        if config.branches.is_empty() || config.branches.len() > MAX_BRANCHES {
            return Err(EngineError::Config(format!(
                "if block '{}': 1-{} branches required",
                name, MAX_BRANCHES
            )));
        }
        let mut conditions = Vec::with_capacity(config.branches.len());
        for (i, branch) in config.branches.iter().enumerate() {
            match &branch.condition {
                BranchCondition::Expression { expression } => {
                    let expr = Expr::parse(expression).map_err(|e| {
                        EngineError::Config(format!("if block '{}' branch {}: {}", name, i, e))
                    })?;
                    for r in expr.references() {
                        if !config.inputs.contains_key(r) {
                            return Err(EngineError::Config(format!(
                                "if block '{}' branch {}: unbound input '[{}]'",
                                name, i, r
                            )));
                        }
                    }
                    conditions.push(CompiledCondition::Expression(expr));
                }
                BranchCondition::Compare {
                    input,
                    op,
                    threshold,
                    threshold2,
                    hysteresis,
                } => conditions.push(CompiledCondition::Compare {
                    input: input.clone(),
                    op: *op,
                    threshold: *threshold,
                    threshold2: *threshold2,
                    hysteresis: *hysteresis,
                }),
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            conditions,
            state: IfState {
                latches: vec![false; config.branches.len()],
            },
        })
    }

    fn output_value(&self, raw: &Value) -> Value {
        if self.config.digital_output {
            // as_bool only fails on NaN, which config values cannot be
            Value::Bool(raw.as_bool().unwrap_or(false))
        } else {
            raw.clone()
        }
    }
}

impl Block for IfBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let mut bindings: Option<HashMap<String, f64>> = None;
        let mut selected: Option<usize> = None;

        for (i, condition) in self.conditions.iter().enumerate() {
            let fired = match condition {
                CompiledCondition::Expression(expr) => {
                    if bindings.is_none() {
                        let mut map = HashMap::with_capacity(self.config.inputs.len());
                        for (alias, source) in &self.config.inputs {
                            map.insert(alias.clone(), store.get_float(source)?);
                        }
                        bindings = Some(map);
                    }
                    // Safe: Some was just assigned above
                    match bindings.as_ref() {
                        Some(map) => expr.eval(map)? != 0.0,
                        None => false,
                    }
                }
                CompiledCondition::Compare {
                    input,
                    op,
                    threshold,
                    threshold2,
                    hysteresis,
                } => {
                    let value = store.get_float(input)?;
                    compare_with_hysteresis(
                        *op,
                        value,
                        *threshold,
                        *threshold2,
                        *hysteresis,
                        self.state.latches[i],
                    )
                }
            };
            self.state.latches[i] = fired;
            if fired && selected.is_none() {
                selected = Some(i);
            }
        }

        let raw = match selected {
            Some(i) => &self.config.branches[i].value,
            None => &self.config.default_value,
        };
        let value = self.output_value(raw);
        store.write_or_add(&self.config.output, value, now, None)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "IF"
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        let restored: IfState = serde_json::from_value(state)?;
        if restored.latches.len() == self.conditions.len() {
            self.state = restored;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state.latches.fill(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(store: &PointStore, id: &str, v: f64) {
        store
            .write_or_add(&SourceRef::Point(id.into()), Value::Float(v), Utc::now(), None)
            .unwrap();
    }

    #[test]
    fn test_formula_evaluates_and_rounds() {
        let store = PointStore::new();
        let config = FormulaConfig {
            inputs: HashMap::from([
                ("a".to_string(), SourceRef::Point("a".into())),
                ("b".to_string(), SourceRef::Point("b".into())),
            ]),
            output: SourceRef::Point("out".into()),
            expression: "([a] + [b]) / 3".to_string(),
            decimal_places: 2,
        };
        let mut block = FormulaBlock::new("calc", &config).unwrap();
        write(&store, "a", 1.0);
        write(&store, "b", 1.0);
        block.execute(&store, Utc::now()).unwrap();
        assert_eq!(store.get_float(&SourceRef::Point("out".into())).unwrap(), 0.67);
        assert!(block.last_error().is_none());
    }

    #[test]
    fn test_formula_rejects_unbound_reference() {
        let config = FormulaConfig {
            inputs: HashMap::new(),
            output: SourceRef::Point("out".into()),
            expression: "[missing] * 2".to_string(),
            decimal_places: 2,
        };
        assert!(FormulaBlock::new("calc", &config).is_err());
    }

    #[test]
    fn test_formula_division_by_zero_records_error() {
        let store = PointStore::new();
        let config = FormulaConfig {
            inputs: HashMap::from([("a".to_string(), SourceRef::Point("a".into()))]),
            output: SourceRef::Point("out".into()),
            expression: "1 / [a]".to_string(),
            decimal_places: 2,
        };
        let mut block = FormulaBlock::new("calc", &config).unwrap();
        write(&store, "a", 0.0);
        assert!(block.execute(&store, Utc::now()).is_err());
        assert!(block.last_error().is_some());
        assert!(!store.exists(&SourceRef::Point("out".into())));
    }

    fn if_config(branches: Vec<Branch>) -> IfConfig {
        IfConfig {
            inputs: HashMap::from([("t".to_string(), SourceRef::Point("t".into()))]),
            output: SourceRef::Point("out".into()),
            branches,
            default_value: Value::Float(0.0),
            digital_output: false,
        }
    }

    #[test]
    fn test_if_first_true_branch_wins() {
        let store = PointStore::new();
        let config = if_config(vec![
            Branch {
                condition: BranchCondition::Expression {
                    expression: "[t] > 30".to_string(),
                },
                value: Value::Float(3.0),
            },
            Branch {
                condition: BranchCondition::Expression {
                    expression: "[t] > 20".to_string(),
                },
                value: Value::Float(2.0),
            },
        ]);
        let mut block = IfBlock::new("sel", &config).unwrap();

        write(&store, "t", 35.0);
        block.execute(&store, Utc::now()).unwrap();
        assert_eq!(store.get_float(&SourceRef::Point("out".into())).unwrap(), 3.0);

        write(&store, "t", 25.0);
        block.execute(&store, Utc::now()).unwrap();
        assert_eq!(store.get_float(&SourceRef::Point("out".into())).unwrap(), 2.0);

        write(&store, "t", 10.0);
        block.execute(&store, Utc::now()).unwrap();
        assert_eq!(store.get_float(&SourceRef::Point("out".into())).unwrap(), 0.0);
    }

    #[test]
    fn test_if_compare_branch_latches() {
        let store = PointStore::new();
        let mut config = if_config(vec![Branch {
            condition: BranchCondition::Compare {
                input: SourceRef::Point("t".into()),
                op: CompareOp::Higher,
                threshold: 50.0,
                threshold2: 0.0,
                hysteresis: 2.0,
            },
            value: Value::Float(1.0),
        }]);
        config.digital_output = true;
        let mut block = IfBlock::new("sel", &config).unwrap();
        let out = SourceRef::Point("out".into());

        write(&store, "t", 53.0);
        block.execute(&store, Utc::now()).unwrap();
        assert!(store.get_bool(&out).unwrap());

        // Inside the band the latch holds
        write(&store, "t", 49.0);
        block.execute(&store, Utc::now()).unwrap();
        assert!(store.get_bool(&out).unwrap());

        write(&store, "t", 47.0);
        block.execute(&store, Utc::now()).unwrap();
        assert!(!store.get_bool(&out).unwrap());
    }

    #[test]
    fn test_if_branch_limit() {
        let branch = Branch {
            condition: BranchCondition::Expression {
                expression: "[t] > 0".to_string(),
            },
            value: Value::Float(1.0),
        };
        let config = if_config(vec![branch; 21]);
        assert!(IfBlock::new("sel", &config).is_err());
    }
}
