// src/blocks/pid.rs - PID controller block with relay autotuning
use super::autotune::{AutoTuner, AutotuneConfig, TunePhase, TuneResult};
use super::{elapsed_secs, Block};
use crate::{
    error::{EngineError, Result},
    point::{PointStore, SourceRef},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Setpoint taken from the store or fixed in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setpoint {
    Fixed(f64),
    Source(SourceRef),
}

/// Converts the analog output into a latched digital command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DigitalStage {
    pub on_threshold: f64,
    pub off_threshold: f64,
}

fn default_out_max() -> f64 {
    100.0
}
fn default_alpha() -> f64 {
    1.0
}
fn default_ff_gain() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    /// Process variable.
    pub input: SourceRef,
    pub setpoint: Setpoint,
    pub output: SourceRef,
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    /// Direct acting: a rising process variable raises the output.
    #[serde(default)]
    pub inverted: bool,
    /// Errors inside this band are treated as zero.
    #[serde(default)]
    pub dead_zone: f64,
    #[serde(default)]
    pub out_min: f64,
    #[serde(default = "default_out_max")]
    pub out_max: f64,
    /// Output rate limit in units per second.
    #[serde(default)]
    pub max_slew: Option<f64>,
    /// First order filter on the derivative term, 1.0 disables filtering.
    #[serde(default = "default_alpha")]
    pub derivative_filter_alpha: f64,
    #[serde(default)]
    pub feed_forward: Option<SourceRef>,
    #[serde(default = "default_ff_gain")]
    pub feed_forward_gain: f64,
    /// Digital auto/manual switch, manual when false. Absent means auto.
    #[serde(default)]
    pub auto_input: Option<SourceRef>,
    /// Output tracked while in manual.
    #[serde(default)]
    pub manual_value: Option<SourceRef>,
    /// Inner loops of a cascade run at higher levels, after their outers.
    #[serde(default)]
    pub cascade_level: u8,
    #[serde(default)]
    pub digital: Option<DigitalStage>,
    #[serde(default)]
    pub autotune: Option<AutotuneConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PidState {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_pv: Option<f64>,
    filtered_derivative: f64,
    last_output: Option<f64>,
    last_time: Option<DateTime<Utc>>,
    digital_latch: bool,
    tuner: Option<AutoTuner>,
}

pub struct PidBlock {
    name: String,
    config: PidConfig,
    state: PidState,
}

impl PidBlock {
    pub fn new(name: &str, config: &PidConfig) -> Result<Self> {
        if config.out_min >= config.out_max {
            return Err(EngineError::Config(format!(
                "pid block '{}': out_min must be below out_max",
                name
            )));
        }
        if !(0.0..=1.0).contains(&config.derivative_filter_alpha) {
            return Err(EngineError::Config(format!(
                "pid block '{}': derivative_filter_alpha must be 0.0-1.0",
                name
            )));
        }
        if let Some(d) = &config.digital {
            if d.off_threshold >= d.on_threshold {
                return Err(EngineError::Config(format!(
                    "pid block '{}': digital off_threshold must be below on_threshold",
                    name
                )));
            }
        }
        if let Some(at) = &config.autotune {
            if at.min_cycles == 0 || at.min_cycles > at.max_cycles {
                return Err(EngineError::Config(format!(
                    "pid block '{}': autotune min_cycles must be 1-max_cycles",
                    name
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: PidState {
                kp: config.kp,
                ki: config.ki,
                kd: config.kd,
                ..PidState::default()
            },
        })
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.state.kp, self.state.ki, self.state.kd)
    }

    pub fn tune_phase(&self) -> TunePhase {
        self.state
            .tuner
            .as_ref()
            .map(|t| t.phase())
            .unwrap_or(TunePhase::Idle)
    }

    pub fn tune_result(&self) -> Option<&TuneResult> {
        self.state.tuner.as_ref().and_then(|t| t.result())
    }

    /// Begin a relay autotune test. Requires an `autotune` section in the
    /// configuration.
    pub fn start_autotune(&mut self) -> Result<()> {
        let config = self.config.autotune.clone().ok_or_else(|| {
            EngineError::Config(format!("pid block '{}': no autotune configuration", self.name))
        })?;
        info!(block = %self.name, "starting autotune");
        let mut tuner = AutoTuner::new(config, (self.state.kp, self.state.ki, self.state.kd));
        tuner.start();
        self.state.tuner = Some(tuner);
        Ok(())
    }

    pub fn cancel_autotune(&mut self) {
        if let Some(tuner) = self.state.tuner.as_mut() {
            tuner.cancel();
        }
    }

    /// Adopt the gains from a completed tune. Tuned gains never take effect
    /// without this explicit call.
    pub fn apply_tuned_gains(&mut self) -> Result<()> {
        let result = self
            .state
            .tuner
            .as_ref()
            .filter(|t| t.phase() == TunePhase::Completed)
            .and_then(|t| t.result().copied())
            .ok_or_else(|| {
                EngineError::Runtime(format!(
                    "pid block '{}': no completed tune to apply",
                    self.name
                ))
            })?;
        info!(
            block = %self.name,
            kp = result.kp,
            ki = result.ki,
            kd = result.kd,
            confidence = result.confidence,
            "applying tuned gains"
        );
        self.state.kp = result.kp;
        self.state.ki = result.ki;
        self.state.kd = result.kd;
        self.state.integral = 0.0;
        self.state.tuner = None;
        Ok(())
    }

    fn setpoint(&self, store: &PointStore) -> Result<f64> {
        match &self.config.setpoint {
            Setpoint::Fixed(v) => Ok(*v),
            Setpoint::Source(s) => store.get_float(s),
        }
    }

    fn write_output(&mut self, store: &PointStore, out: f64, now: DateTime<Utc>) -> Result<()> {
        self.state.last_output = Some(out);
        match self.config.digital {
            Some(stage) => {
                if out >= stage.on_threshold {
                    self.state.digital_latch = true;
                } else if out <= stage.off_threshold {
                    self.state.digital_latch = false;
                }
                store.write_or_add(
                    &self.config.output,
                    Value::Bool(self.state.digital_latch),
                    now,
                    None,
                )
            }
            None => store.write_or_add(&self.config.output, Value::Float(out), now, None),
        }
    }

    fn slew_limit(&self, out: f64, dt: f64) -> f64 {
        match (self.config.max_slew, self.state.last_output) {
            (Some(slew), Some(prev)) if dt > 0.0 => {
                let max_delta = slew * dt;
                out.clamp(prev - max_delta, prev + max_delta)
            }
            _ => out,
        }
    }
}

impl Block for PidBlock {
    fn execute(&mut self, store: &PointStore, now: DateTime<Utc>) -> Result<()> {
        let pv = store.get_float(&self.config.input)?;
        let sp = self.setpoint(store)?;
        let dt = self
            .state
            .last_time
            .map(|t| elapsed_secs(t, now))
            .unwrap_or(0.0);
        self.state.last_time = Some(now);

        // Relay test drives the output directly while it is running.
        if let Some(tuner) = self.state.tuner.as_mut() {
            if tuner.is_running() {
                let center = (self.config.out_min + self.config.out_max) / 2.0;
                if let Some(out) = tuner.step(pv, sp, center, now) {
                    let out = out.clamp(self.config.out_min, self.config.out_max);
                    self.state.last_pv = Some(pv);
                    return self.write_output(store, out, now);
                }
                debug!(block = %self.name, phase = ?self.tune_phase(), "autotune finished");
            }
        }

        let auto = match &self.config.auto_input {
            Some(s) => store.get_bool(s)?,
            None => true,
        };
        if !auto {
            // Manual mode tracks the commanded value; the integral freezes
            // where it was, so transfer back is close to bumpless.
            let out = match &self.config.manual_value {
                Some(s) => store.get_float(s)?,
                None => self.state.last_output.unwrap_or(self.config.out_min),
            };
            let out = out.clamp(self.config.out_min, self.config.out_max);
            self.state.last_pv = Some(pv);
            return self.write_output(store, out, now);
        }

        let mut error = if self.config.inverted { pv - sp } else { sp - pv };
        if error.abs() <= self.config.dead_zone {
            error = 0.0;
        }

        let p = self.state.kp * error;

        // Derivative on measurement, filtered to tame noise.
        let raw_d = match (self.state.last_pv, dt > 0.0) {
            (Some(last), true) => {
                let dpv = (pv - last) / dt;
                if self.config.inverted {
                    dpv
                } else {
                    -dpv
                }
            }
            _ => 0.0,
        };
        let alpha = self.config.derivative_filter_alpha;
        self.state.filtered_derivative =
            alpha * raw_d + (1.0 - alpha) * self.state.filtered_derivative;
        self.state.last_pv = Some(pv);

        let ff = match &self.config.feed_forward {
            Some(s) => store.get_float(s)? * self.config.feed_forward_gain,
            None => 0.0,
        };

        // Anti-windup by back calculation: the integral is clamped so the
        // combined output never winds past the limits.
        let rest = p + self.state.kd * self.state.filtered_derivative + ff;
        let mut integral = self.state.integral + self.state.ki * error * dt;
        if self.state.ki != 0.0 {
            let clamped =
                integral.clamp(self.config.out_min - rest, self.config.out_max - rest);
            if clamped != integral {
                debug!(block = %self.name, "integral clamped, output saturated");
                integral = clamped;
            }
        }
        self.state.integral = integral;

        let out = rest + integral;
        let out = self.slew_limit(out, dt);
        let out = out.clamp(self.config.out_min, self.config.out_max);
        self.write_output(store, out, now)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn block_type(&self) -> &str {
        "PID"
    }

    fn cascade_level(&self) -> u8 {
        self.config.cascade_level
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        let restored: PidState = serde_json::from_value(state)?;
        // Snapshots from before a gain change would resurrect stale gains
        if restored.kp != 0.0 || restored.ki != 0.0 || restored.kd != 0.0 {
            self.state = restored;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = PidState {
            kp: self.config.kp,
            ki: self.config.ki,
            kd: self.config.kd,
            ..PidState::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PidConfig {
        PidConfig {
            input: SourceRef::Point("pv".into()),
            setpoint: Setpoint::Fixed(50.0),
            output: SourceRef::Point("cv".into()),
            kp: 2.0,
            ki: 0.0,
            kd: 0.0,
            inverted: false,
            dead_zone: 0.0,
            out_min: 0.0,
            out_max: 100.0,
            max_slew: None,
            derivative_filter_alpha: 1.0,
            feed_forward: None,
            feed_forward_gain: 1.0,
            auto_input: None,
            manual_value: None,
            cascade_level: 0,
            digital: None,
            autotune: None,
        }
    }

    fn write(store: &PointStore, id: &str, v: Value, now: DateTime<Utc>) {
        store.write_or_add(&SourceRef::Point(id.into()), v, now, None).unwrap();
    }

    fn output(store: &PointStore) -> f64 {
        store.get_float(&SourceRef::Point("cv".into())).unwrap()
    }

    #[test]
    fn test_proportional_only() {
        let store = PointStore::new();
        let mut block = PidBlock::new("pid", &base_config()).unwrap();
        let now = Utc::now();
        write(&store, "pv", Value::Float(40.0), now);
        block.execute(&store, now).unwrap();
        // error 10 at kp 2
        assert_eq!(output(&store), 20.0);
    }

    #[test]
    fn test_integral_accumulates() {
        let store = PointStore::new();
        let mut config = base_config();
        config.kp = 0.0;
        config.ki = 1.0;
        let mut block = PidBlock::new("pid", &config).unwrap();
        let t0 = Utc::now();
        write(&store, "pv", Value::Float(45.0), t0);
        block.execute(&store, t0).unwrap();
        // First tick has no dt, integral stays at zero
        assert_eq!(output(&store), 0.0);

        let t1 = t0 + chrono::Duration::seconds(2);
        block.execute(&store, t1).unwrap();
        // error 5 for 2s at ki 1
        assert_eq!(output(&store), 10.0);
    }

    #[test]
    fn test_integral_held_at_saturation() {
        let store = PointStore::new();
        let mut config = base_config();
        config.kp = 0.0;
        config.ki = 10.0;
        let mut block = PidBlock::new("pid", &config).unwrap();
        let t0 = Utc::now();
        write(&store, "pv", Value::Float(0.0), t0);
        for i in 0..10 {
            block.execute(&store, t0 + chrono::Duration::seconds(i)).unwrap();
        }
        assert_eq!(output(&store), 100.0);
        // The integral never wound past the limit, so recovery is immediate
        assert!(block.state.integral <= 100.0 + 1e-9);
    }

    #[test]
    fn test_dead_zone_suppresses_small_errors() {
        let store = PointStore::new();
        let mut config = base_config();
        config.dead_zone = 2.0;
        let mut block = PidBlock::new("pid", &config).unwrap();
        let now = Utc::now();
        write(&store, "pv", Value::Float(48.5), now);
        block.execute(&store, now).unwrap();
        assert_eq!(output(&store), 0.0);
    }

    #[test]
    fn test_inverted_action() {
        let store = PointStore::new();
        let mut config = base_config();
        config.inverted = true;
        let mut block = PidBlock::new("pid", &config).unwrap();
        let now = Utc::now();
        // pv above setpoint drives a direct acting controller up
        write(&store, "pv", Value::Float(60.0), now);
        block.execute(&store, now).unwrap();
        assert_eq!(output(&store), 20.0);
    }

    #[test]
    fn test_slew_rate_limit() {
        let store = PointStore::new();
        let mut config = base_config();
        config.max_slew = Some(5.0);
        let mut block = PidBlock::new("pid", &config).unwrap();
        let t0 = Utc::now();
        write(&store, "pv", Value::Float(50.0), t0);
        block.execute(&store, t0).unwrap();
        assert_eq!(output(&store), 0.0);

        write(&store, "pv", Value::Float(30.0), t0);
        let t1 = t0 + chrono::Duration::seconds(1);
        block.execute(&store, t1).unwrap();
        // Raw output would be 40, limited to 5 units over 1s
        assert_eq!(output(&store), 5.0);
    }

    #[test]
    fn test_manual_mode_tracks_and_holds_integral() {
        let store = PointStore::new();
        let mut config = base_config();
        config.ki = 1.0;
        config.auto_input = Some(SourceRef::Point("auto".into()));
        config.manual_value = Some(SourceRef::Point("manual".into()));
        let mut block = PidBlock::new("pid", &config).unwrap();
        let t0 = Utc::now();
        write(&store, "pv", Value::Float(45.0), t0);
        write(&store, "auto", Value::Bool(true), t0);
        write(&store, "manual", Value::Float(33.0), t0);
        block.execute(&store, t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(1);
        block.execute(&store, t1).unwrap();
        let integral_before = block.state.integral;
        assert!(integral_before > 0.0);

        write(&store, "auto", Value::Bool(false), t1);
        let t2 = t1 + chrono::Duration::seconds(5);
        block.execute(&store, t2).unwrap();
        assert_eq!(output(&store), 33.0);
        assert_eq!(block.state.integral, integral_before);
    }

    #[test]
    fn test_feed_forward_adds_to_output() {
        let store = PointStore::new();
        let mut config = base_config();
        config.feed_forward = Some(SourceRef::Point("ff".into()));
        config.feed_forward_gain = 0.5;
        let mut block = PidBlock::new("pid", &config).unwrap();
        let now = Utc::now();
        write(&store, "pv", Value::Float(40.0), now);
        write(&store, "ff", Value::Float(10.0), now);
        block.execute(&store, now).unwrap();
        assert_eq!(output(&store), 25.0);
    }

    #[test]
    fn test_digital_stage_latches() {
        let store = PointStore::new();
        let mut config = base_config();
        config.digital = Some(DigitalStage {
            on_threshold: 60.0,
            off_threshold: 40.0,
        });
        let mut block = PidBlock::new("pid", &config).unwrap();
        let out = SourceRef::Point("cv".into());
        let now = Utc::now();

        write(&store, "pv", Value::Float(10.0), now);
        block.execute(&store, now).unwrap();
        assert!(store.get_bool(&out).unwrap());

        // 50 is inside the band, the latch holds
        write(&store, "pv", Value::Float(25.0), now);
        block.execute(&store, now).unwrap();
        assert!(store.get_bool(&out).unwrap());

        write(&store, "pv", Value::Float(45.0), now);
        block.execute(&store, now).unwrap();
        assert!(!store.get_bool(&out).unwrap());
    }

    #[test]
    fn test_autotune_cycle_bounds_validated() {
        let mut config = base_config();
        let mut at = AutotuneConfig::default();
        at.min_cycles = 10;
        at.max_cycles = 4;
        config.autotune = Some(at);
        assert!(PidBlock::new("pid", &config).is_err());
    }

    #[test]
    fn test_autotune_requires_configuration() {
        let mut block = PidBlock::new("pid", &base_config()).unwrap();
        assert!(block.start_autotune().is_err());
        assert_eq!(block.tune_phase(), TunePhase::Idle);
    }

    #[test]
    fn test_autotune_gains_apply_only_on_request() {
        let store = PointStore::new();
        let mut config = base_config();
        config.autotune = Some(AutotuneConfig::default());
        let mut block = PidBlock::new("pid", &config).unwrap();
        block.start_autotune().unwrap();
        assert!(block.apply_tuned_gains().is_err());

        // Drive a synthetic oscillation through the relay test
        let t0 = Utc::now();
        let mut i = 0i64;
        while block.tune_phase() != TunePhase::Completed && i < 600 {
            let pv = 50.0 - 5.0 * (2.0 * std::f64::consts::PI * i as f64 / 60.0).cos();
            write(&store, "pv", Value::Float(pv), t0 + chrono::Duration::seconds(i));
            block.execute(&store, t0 + chrono::Duration::seconds(i)).unwrap();
            i += 1;
        }
        assert_eq!(block.tune_phase(), TunePhase::Completed);
        assert_eq!(block.gains(), (2.0, 0.0, 0.0));

        block.apply_tuned_gains().unwrap();
        let (kp, ki, kd) = block.gains();
        assert!((kp - 3.056).abs() < 0.5);
        assert!(ki > 0.0);
        assert!(kd > 0.0);
    }
}
