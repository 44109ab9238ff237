// src/point.rs - Point/variable store, the sole channel between blocks and the process
use crate::{
    error::{EngineError, Result},
    value::Value,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Field I/O direction and signal kind of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
}

/// Type of a global variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Boolean,
    Float,
}

/// Addressing target for block inputs and outputs: either a field-backed
/// point or a lightweight global variable. Resolved through one indirection
/// in the [`PointStore`] so blocks never special-case the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRef {
    Point(String),
    Variable(String),
}

impl SourceRef {
    pub fn id(&self) -> &str {
        match self {
            SourceRef::Point(id) | SourceRef::Variable(id) => id,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Point(id) => write!(f, "point:{}", id),
            SourceRef::Variable(id) => write!(f, "variable:{}", id),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    timestamp: DateTime<Utc>,
    /// While set and in the future, plain writes are ignored; the entry is
    /// reserved by an operator/duration write until the hold expires.
    hold_until: Option<DateTime<Utc>>,
}

/// Thread-safe store for current point values and global variables.
///
/// This is the only shared mutable resource in the engine. All block inputs
/// are read from it and all block outputs are written through it; writes are
/// last-write-wins at tick granularity.
///
/// # Examples
///
/// ```rust
/// use vela::{PointStore, SourceRef, Value};
/// use chrono::Utc;
///
/// let store = PointStore::new();
/// let now = Utc::now();
/// let temp = SourceRef::Point("supply_temp".into());
///
/// store.write_or_add(&temp, Value::Float(21.5), now, None)?;
/// let (value, _ts) = store.read(&temp)?;
/// assert_eq!(value, Value::Float(21.5));
/// # Ok::<(), vela::EngineError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct PointStore {
    points: Arc<DashMap<String, Entry>>,
    variables: Arc<DashMap<String, Entry>>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, source: &SourceRef) -> &DashMap<String, Entry> {
        match source {
            SourceRef::Point(_) => &self.points,
            SourceRef::Variable(_) => &self.variables,
        }
    }

    /// Register an entry with an initial value. Used at configuration load;
    /// equivalent to `write_or_add` without hold semantics.
    pub fn register(&self, source: &SourceRef, initial: Value, now: DateTime<Utc>) {
        self.map(source).insert(
            source.id().to_string(),
            Entry {
                value: initial,
                timestamp: now,
                hold_until: None,
            },
        );
    }

    /// Read the current value and its timestamp.
    pub fn read(&self, source: &SourceRef) -> Result<(Value, DateTime<Utc>)> {
        self.map(source)
            .get(source.id())
            .map(|e| (e.value.clone(), e.timestamp))
            .ok_or_else(|| EngineError::PointNotFound(source.to_string()))
    }

    /// Write a value to an existing entry.
    ///
    /// `duration_secs` of `None` or zero is an instant write-and-release. A
    /// positive duration reserves the entry: later plain writes are ignored
    /// until the reservation expires, after which the entry reverts to
    /// automatic control. Reservations only apply to points.
    pub fn write(
        &self,
        source: &SourceRef,
        value: Value,
        now: DateTime<Utc>,
        duration_secs: Option<f64>,
    ) -> Result<()> {
        let map = self.map(source);
        let mut entry = map
            .get_mut(source.id())
            .ok_or_else(|| EngineError::PointNotFound(source.to_string()))?;
        Self::apply(source, &mut entry, value, now, duration_secs);
        Ok(())
    }

    /// Write a value, creating the entry when it does not exist yet.
    pub fn write_or_add(
        &self,
        source: &SourceRef,
        value: Value,
        now: DateTime<Utc>,
        duration_secs: Option<f64>,
    ) -> Result<()> {
        let map = self.map(source);
        match map.get_mut(source.id()) {
            Some(mut entry) => Self::apply(source, &mut entry, value, now, duration_secs),
            None => {
                let hold = Self::hold_deadline(source, now, duration_secs);
                map.insert(
                    source.id().to_string(),
                    Entry {
                        value,
                        timestamp: now,
                        hold_until: hold,
                    },
                );
            }
        }
        Ok(())
    }

    fn hold_deadline(
        source: &SourceRef,
        now: DateTime<Utc>,
        duration_secs: Option<f64>,
    ) -> Option<DateTime<Utc>> {
        match (source, duration_secs) {
            (SourceRef::Point(_), Some(d)) if d > 0.0 => {
                Some(now + chrono::Duration::milliseconds((d * 1000.0) as i64))
            }
            _ => None,
        }
    }

    fn apply(
        source: &SourceRef,
        entry: &mut Entry,
        value: Value,
        now: DateTime<Utc>,
        duration_secs: Option<f64>,
    ) {
        let reserved = entry.hold_until.map(|h| now < h).unwrap_or(false);
        let reserving = duration_secs.map(|d| d > 0.0).unwrap_or(false);
        if reserved && !reserving {
            trace!("write to {} ignored, entry is reserved", source);
            return;
        }
        trace!("writing {} = {}", source, value);
        entry.value = value;
        entry.timestamp = now;
        entry.hold_until = Self::hold_deadline(source, now, duration_secs);
    }

    /// Read a value converted to a boolean.
    pub fn get_bool(&self, source: &SourceRef) -> Result<bool> {
        let (value, _) = self.read(source)?;
        value.as_bool().ok_or_else(|| EngineError::TypeMismatch {
            expected: "bool".into(),
            actual: value.type_name().into(),
        })
    }

    /// Read a value converted to a float.
    pub fn get_float(&self, source: &SourceRef) -> Result<f64> {
        let (value, _) = self.read(source)?;
        value.as_float().ok_or_else(|| EngineError::TypeMismatch {
            expected: "float".into(),
            actual: value.type_name().into(),
        })
    }

    /// Seconds since the entry was last written. Used for staleness checks
    /// and timeout alarms.
    pub fn age_secs(&self, source: &SourceRef, now: DateTime<Utc>) -> Result<f64> {
        let (_, ts) = self.read(source)?;
        Ok((now - ts).num_milliseconds() as f64 / 1000.0)
    }

    pub fn exists(&self, source: &SourceRef) -> bool {
        self.map(source).contains_key(source.id())
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str) -> SourceRef {
        SourceRef::Point(id.into())
    }

    #[test]
    fn test_read_write_round_trip() {
        let store = PointStore::new();
        let now = Utc::now();
        let src = point("t1");

        assert!(store.write(&src, Value::Float(1.0), now, None).is_err());
        store.write_or_add(&src, Value::Float(1.0), now, None).unwrap();
        let (v, ts) = store.read(&src).unwrap();
        assert_eq!(v, Value::Float(1.0));
        assert_eq!(ts, now);
    }

    #[test]
    fn test_point_and_variable_namespaces_are_distinct() {
        let store = PointStore::new();
        let now = Utc::now();
        store
            .write_or_add(&point("x"), Value::Float(1.0), now, None)
            .unwrap();
        assert!(store.read(&SourceRef::Variable("x".into())).is_err());
    }

    #[test]
    fn test_duration_write_reserves_point() {
        let store = PointStore::new();
        let t0 = Utc::now();
        let src = point("valve");
        store.register(&src, Value::Float(0.0), t0);

        // Operator write with a 10 second reservation
        store.write(&src, Value::Float(100.0), t0, Some(10.0)).unwrap();

        // Automatic write during the hold is ignored
        let t1 = t0 + chrono::Duration::seconds(5);
        store.write(&src, Value::Float(42.0), t1, None).unwrap();
        assert_eq!(store.get_float(&src).unwrap(), 100.0);

        // After expiry the point reverts to automatic control
        let t2 = t0 + chrono::Duration::seconds(11);
        store.write(&src, Value::Float(42.0), t2, None).unwrap();
        assert_eq!(store.get_float(&src).unwrap(), 42.0);
    }

    #[test]
    fn test_variable_ignores_duration() {
        let store = PointStore::new();
        let now = Utc::now();
        let var = SourceRef::Variable("mode".into());
        store.write_or_add(&var, Value::Bool(true), now, Some(60.0)).unwrap();
        store
            .write(&var, Value::Bool(false), now + chrono::Duration::seconds(1), None)
            .unwrap();
        assert!(!store.get_bool(&var).unwrap());
    }

    #[test]
    fn test_age_secs() {
        let store = PointStore::new();
        let t0 = Utc::now();
        let src = point("a");
        store.register(&src, Value::Float(0.0), t0);
        let age = store.age_secs(&src, t0 + chrono::Duration::seconds(30)).unwrap();
        assert!((age - 30.0).abs() < 1e-6);
    }
}
