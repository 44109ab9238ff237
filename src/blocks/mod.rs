//! Processing block library.
//!
//! One module per block family. Every block is created from its typed
//! configuration through the central [`create_block`] factory, scheduled
//! independently by the engine, and keeps its mutable runtime state in a
//! serde struct so it can be snapshotted and restored across restarts.

use crate::{config::BlockConfig, error::Result, point::PointStore};
use chrono::{DateTime, Utc};

pub mod action;
pub mod average;
pub mod autotune;
pub mod deadband;
pub mod formula;
pub mod pid;
pub mod rate;
pub mod schedule;
pub mod selector;
pub mod statistics;
pub mod totalizer;
pub mod voting;

/// Core trait implemented by every processing block.
///
/// `execute` is called by the scheduler each time the instance comes due,
/// with the shared point/variable store and the current time. State
/// mutations happen only inside `execute`; the engine guarantees at most
/// one evaluation of an instance is in flight at a time.
pub trait Block: Send + Sync {
    /// Run one evaluation against the store.
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()>;

    /// Instance name (unique within a configuration).
    fn name(&self) -> &str;

    /// Block type identifier.
    fn block_type(&self) -> &str;

    /// Cascade evaluation level. Within one tick, lower levels execute
    /// before higher ones; only PID controllers use levels above 0.
    fn cascade_level(&self) -> u8 {
        0
    }

    /// Serialize the mutable runtime state for persistence.
    fn snapshot(&self) -> Result<serde_json::Value>;

    /// Restore previously persisted runtime state.
    fn restore(&mut self, state: serde_json::Value) -> Result<()>;

    /// Reset runtime state to its initial value.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Most recent evaluation error, where the block records one.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Create a block instance from its configuration.
pub fn create_block(config: &BlockConfig) -> Result<Box<dyn Block>> {
    use crate::config::BlockParams;

    tracing::debug!("creating block '{}'", config.name);
    let name = &config.name;
    Ok(match &config.params {
        BlockParams::Average(c) => Box::new(average::AverageBlock::new(name, c)?),
        BlockParams::Voting(c) => Box::new(voting::VotingBlock::new(name, c)?),
        BlockParams::Deadband(c) => Box::new(deadband::DeadbandBlock::new(name, c)?),
        BlockParams::RateOfChange(c) => Box::new(rate::RateOfChangeBlock::new(name, c)?),
        BlockParams::Statistics(c) => Box::new(statistics::StatisticsBlock::new(name, c)?),
        BlockParams::Totalizer(c) => Box::new(totalizer::TotalizerBlock::new(name, c)?),
        BlockParams::Schedule(c) => Box::new(schedule::ScheduleBlock::new(name, c)?),
        BlockParams::Formula(c) => Box::new(formula::FormulaBlock::new(name, c)?),
        BlockParams::If(c) => Box::new(formula::IfBlock::new(name, c)?),
        BlockParams::MinMax(c) => Box::new(selector::MinMaxBlock::new(name, c)?),
        BlockParams::WriteAction(c) => Box::new(action::WriteActionBlock::new(name, c)?),
        BlockParams::Timeout(c) => Box::new(action::TimeoutBlock::new(name, c)?),
        BlockParams::Pid(c) => Box::new(pid::PidBlock::new(name, c)?),
    })
}

/// Elapsed seconds between two timestamps, clamped at zero.
pub(crate) fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}
