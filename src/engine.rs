// src/engine.rs - Scheduler driving blocks and alarms on independent intervals
use crate::{
    alarms::AlarmManager,
    blocks::{create_block, Block},
    config::Config,
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

struct BlockSlot {
    block: Box<dyn Block>,
    interval_secs: f64,
    enabled: bool,
    /// `None` until the first pass; the schedule anchors to the clock the
    /// caller drives `step` with, never the construction instant.
    next_due: Option<DateTime<Utc>>,
    last_error: Option<String>,
    run_count: u64,
    error_count: u64,
}

struct AlarmSlot {
    index: usize,
    next_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Scheduler ticks completed.
    pub tick_count: u64,
    /// Individual block evaluations.
    pub run_count: u64,
    pub error_count: u64,
    pub block_count: usize,
    pub alarm_count: usize,
}

pub struct Engine {
    store: PointStore,
    slots: Vec<BlockSlot>,
    alarms: AlarmManager,
    alarm_slots: Vec<AlarmSlot>,
    alarm_interval_secs: f64,
    base_resolution: Duration,
    running: Arc<AtomicBool>,
    tick_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = PointStore::new();
        let now = Utc::now();
        for p in &config.points {
            let initial = p.initial.clone().unwrap_or(Value::Float(0.0));
            store.register(&SourceRef::Point(p.id.clone()), initial, now);
        }
        for v in &config.variables {
            let initial = v.initial.clone().unwrap_or(Value::Float(0.0));
            store.register(&SourceRef::Variable(v.id.clone()), initial, now);
        }

        let mut slots = Vec::with_capacity(config.blocks.len());
        for bc in &config.blocks {
            let block = create_block(bc)?;
            slots.push(BlockSlot {
                block,
                interval_secs: bc.interval_secs,
                enabled: bc.enabled,
                next_due: None,
                last_error: None,
                run_count: 0,
                error_count: 0,
            });
        }

        let alarms = AlarmManager::new(&config.alarms)?;
        let alarm_slots = (0..alarms.alarm_count())
            .map(|index| AlarmSlot {
                index,
                next_due: None,
            })
            .collect();

        info!(
            blocks = slots.len(),
            alarms = alarms.alarm_count(),
            points = store.point_count(),
            "engine initialized"
        );
        Ok(Self {
            store,
            slots,
            alarms,
            alarm_slots,
            alarm_interval_secs: config.engine.alarm_interval_secs,
            base_resolution: Duration::from_millis(config.engine.base_resolution_ms),
            running: Arc::new(AtomicBool::new(false)),
            tick_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn store(&self) -> &PointStore {
        &self.store
    }

    pub fn alarms(&self) -> &AlarmManager {
        &self.alarms
    }

    pub fn alarms_mut(&mut self) -> &mut AlarmManager {
        &mut self.alarms
    }

    /// One scheduler pass at the given instant. Due blocks evaluate first,
    /// ordered by cascade level then configuration order, then due alarms.
    pub fn step(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut due: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.next_due.map_or(true, |due| now >= due))
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| (self.slots[i].block.cascade_level(), i));

        for i in due {
            let slot = &mut self.slots[i];
            slot.next_due =
                Some(now + chrono::Duration::milliseconds((slot.interval_secs * 1000.0) as i64));
            if !slot.enabled {
                // The slot advances so a re-enable does not replay backlog.
                continue;
            }
            slot.run_count += 1;
            if let Err(e) = slot.block.execute(&self.store, now) {
                slot.error_count += 1;
                slot.last_error = Some(e.to_string());
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(block = slot.block.name(), error = %e, "block evaluation failed");
            } else {
                slot.last_error = None;
            }
        }

        for slot in &mut self.alarm_slots {
            if slot.next_due.map_or(false, |due| now < due) {
                continue;
            }
            slot.next_due = Some(
                now + chrono::Duration::milliseconds((self.alarm_interval_secs * 1000.0) as i64),
            );
            if let Err(e) = self.alarms.evaluate_at(slot.index, &self.store, now) {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(alarm = slot.index, error = %e, "alarm evaluation failed");
            }
        }

        self.tick_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Run the scheduler until [`stop`](Self::stop) is called.
    pub async fn run(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(EngineError::Runtime("engine is already running".into()));
        }
        info!(
            resolution_ms = self.base_resolution.as_millis() as u64,
            "engine started"
        );

        let mut ticker = interval(self.base_resolution);
        while self.running.load(Ordering::Relaxed) {
            ticker.tick().await;
            if let Err(e) = self.step(Utc::now()) {
                error!(error = %e, "scheduler tick failed");
            }
        }
        info!("engine stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tick_count: self.tick_count.load(Ordering::Relaxed),
            run_count: self.slots.iter().map(|s| s.run_count).sum(),
            error_count: self.error_count.load(Ordering::Relaxed),
            block_count: self.slots.len(),
            alarm_count: self.alarms.alarm_count(),
        }
    }

    pub fn block_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.block.name()).collect()
    }

    pub fn last_error(&self, block: &str) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.block.name() == block)
            .and_then(|s| s.last_error.as_deref())
    }

    pub fn set_enabled(&mut self, block: &str, enabled: bool) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.block.name() == block)
            .ok_or_else(|| EngineError::Runtime(format!("no block named '{}'", block)))?;
        debug!(block, enabled, "block enable changed");
        slot.enabled = enabled;
        Ok(())
    }

    /// Mutable access to a block, for operations such as schedule overrides
    /// or starting a PID autotune.
    pub fn block_mut(&mut self, name: &str) -> Option<&mut Box<dyn Block>> {
        self.slots
            .iter_mut()
            .find(|s| s.block.name() == name)
            .map(|s| &mut s.block)
    }

    /// Serialize all block state plus the alarm tables, keyed by name.
    pub fn snapshot_state(&self) -> Result<serde_json::Value> {
        let mut blocks = HashMap::new();
        for slot in &self.slots {
            blocks.insert(slot.block.name().to_string(), slot.block.snapshot()?);
        }
        Ok(serde_json::json!({
            "blocks": blocks,
            "alarms": self.alarms.snapshot()?,
        }))
    }

    /// Restore a previously persisted snapshot. Blocks missing from the
    /// snapshot keep their initial state; snapshots of blocks that no longer
    /// exist are ignored.
    pub fn restore_state(&mut self, snapshot: serde_json::Value) -> Result<()> {
        if let Some(blocks) = snapshot.get("blocks").and_then(|b| b.as_object()) {
            for slot in &mut self.slots {
                if let Some(state) = blocks.get(slot.block.name()) {
                    if let Err(e) = slot.block.restore(state.clone()) {
                        warn!(
                            block = slot.block.name(),
                            error = %e,
                            "state restore failed, starting clean"
                        );
                    }
                }
            }
        }
        if let Some(alarms) = snapshot.get("alarms") {
            self.alarms.restore(alarms.clone())?;
        }
        Ok(())
    }
}
