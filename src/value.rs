// src/value.rs - Core value type flowing through the point/variable store
use serde::{Deserialize, Serialize};
use std::fmt;

/// Core value type enumeration.
///
/// Every value observed or produced by the engine is one of these three
/// variants. Digital points and boolean variables carry [`Value::Bool`],
/// analog points carry [`Value::Float`]; [`Value::Int`] exists for counters
/// and index outputs.
///
/// # Examples
///
/// ```rust
/// use vela::Value;
///
/// let v = Value::Int(42);
/// assert_eq!(v.as_float(), Some(42.0));
/// assert_eq!(Value::Bool(true).as_int(), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating-point value (64-bit)
    Float(f64),
}

impl Value {
    /// Interpret the value as a boolean, converting where appropriate.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => {
                if f.is_nan() {
                    None
                } else {
                    Some(*f != 0.0)
                }
            }
        }
    }

    /// Interpret the value as an integer, converting where appropriate.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) => {
                if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
        }
    }

    /// Interpret the value as a float, converting where appropriate.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
        }
    }

    /// Name of the variant, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
