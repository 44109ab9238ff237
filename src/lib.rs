//! VELA - Value Evaluation and Logic Automation
//!
//! A processing and control engine for building and industrial monitoring.
//! Stateful algorithm blocks (averaging, voting, deadband, rate-of-change,
//! totalizing, scheduling, formulas, selectors and PID control with relay
//! autotuning) read from and write to a shared point store, each on its own
//! evaluation interval, alongside a debounced alarm evaluator with a bounded
//! event history.
//!
//! # Examples
//!
//! ```rust,no_run
//! use vela::{Config, Engine};
//!
//! # async fn run() -> vela::Result<()> {
//! let config = Config::from_file("config.yaml")?;
//! let mut engine = Engine::new(config)?;
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod alarms;
pub mod blocks;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod persist;
pub mod point;
pub mod value;

pub use alarms::{
    ActiveAlarm, AlarmConfig, AlarmEvent, AlarmEventKind, AlarmManager, AlarmPriority,
    ExternalAlarm,
};
pub use blocks::{create_block, Block};
pub use config::{BlockConfig, BlockParams, CompareOp, Config, EngineConfig};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result};
pub use expr::Expr;
pub use persist::{FileStateStore, MemoryStateStore, StateStore};
pub use point::{PointStore, PointType, SourceRef, VariableType};
pub use value::Value;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
