// src/blocks/autotune.rs - Relay feedback autotuner for PID gains
use super::elapsed_secs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{info, warn};

fn default_relay_amplitude() -> f64 {
    20.0
}
fn default_hysteresis() -> f64 {
    1.0
}
fn default_min_cycles() -> u32 {
    4
}
fn default_max_cycles() -> u32 {
    20
}
fn default_timeout() -> f64 {
    3600.0
}

/// Minimum cycle-to-cycle consistency score for convergence.
const MIN_CYCLE_CONSISTENCY: f64 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotuneConfig {
    /// Controller output swing above and below the operating center.
    #[serde(default = "default_relay_amplitude")]
    pub relay_amplitude: f64,
    /// Switching band around the setpoint, suppresses noise chatter.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
    /// Full oscillation cycles required before gains are computed.
    #[serde(default = "default_min_cycles")]
    pub min_cycles: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
    /// Test aborts if the process swings further than this from setpoint.
    #[serde(default)]
    pub max_process_amplitude: Option<f64>,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            relay_amplitude: default_relay_amplitude(),
            hysteresis: default_hysteresis(),
            min_cycles: default_min_cycles(),
            max_cycles: default_max_cycles(),
            timeout_secs: default_timeout(),
            max_process_amplitude: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunePhase {
    Idle,
    Initializing,
    RelayTest,
    AnalyzingData,
    Completed,
    Aborted,
    Failed,
}

/// Computed tuning outcome, held until applied or discarded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TuneResult {
    pub ultimate_gain: f64,
    pub ultimate_period: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// 0.0 to 1.0, derived from cycle-to-cycle consistency.
    pub confidence: f64,
    pub cycles: u32,
}

/// Ziegler-Nichols closed-loop gains from relay test measurements.
///
/// `d` is the relay amplitude, `pu` the oscillation period in seconds and
/// `a` the peak-to-peak process amplitude divided by two.
pub(crate) fn ziegler_nichols(d: f64, pu: f64, a: f64) -> (f64, f64, f64, f64) {
    let ku = 4.0 * d / (PI * a);
    let kp = 0.6 * ku;
    let ki = 1.2 * ku / pu;
    let kd = 0.075 * ku * pu;
    (ku, kp, ki, kd)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CycleData {
    /// Timestamps of rising relay switches; consecutive pairs bound cycles.
    rises: Vec<DateTime<Utc>>,
    /// Peak-to-peak process amplitude of each completed cycle.
    amplitudes: Vec<f64>,
    cycle_max: f64,
    cycle_min: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTuner {
    config: AutotuneConfig,
    phase: TunePhase,
    started: Option<DateTime<Utc>>,
    relay_high: bool,
    cycles: CycleData,
    result: Option<TuneResult>,
    /// Gains in force before the test, restorable on abort.
    original_gains: (f64, f64, f64),
}

impl AutoTuner {
    pub fn new(config: AutotuneConfig, original_gains: (f64, f64, f64)) -> Self {
        Self {
            config,
            phase: TunePhase::Idle,
            started: None,
            relay_high: true,
            cycles: CycleData::default(),
            result: None,
            original_gains,
        }
    }

    pub fn phase(&self) -> TunePhase {
        self.phase
    }

    pub fn result(&self) -> Option<&TuneResult> {
        self.result.as_ref()
    }

    pub fn original_gains(&self) -> (f64, f64, f64) {
        self.original_gains
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.phase,
            TunePhase::Initializing | TunePhase::RelayTest | TunePhase::AnalyzingData
        )
    }

    pub fn start(&mut self) {
        self.phase = TunePhase::Initializing;
        self.started = None;
        self.relay_high = true;
        self.cycles = CycleData::default();
        self.result = None;
    }

    pub fn cancel(&mut self) {
        if self.is_running() {
            info!("autotune cancelled");
            self.phase = TunePhase::Aborted;
        }
    }

    fn fail(&mut self, reason: &str) {
        warn!(reason, "autotune failed");
        self.phase = TunePhase::Failed;
    }

    /// Advance the relay test by one sample. Returns the controller output
    /// to apply, centered on `center`, while the test is running.
    pub fn step(
        &mut self,
        pv: f64,
        setpoint: f64,
        center: f64,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if !self.is_running() {
            return None;
        }

        if self.phase == TunePhase::Initializing {
            self.started = Some(now);
            self.cycles.cycle_max = pv;
            self.cycles.cycle_min = pv;
            self.phase = TunePhase::RelayTest;
        }

        if let Some(started) = self.started {
            if elapsed_secs(started, now) > self.config.timeout_secs {
                self.fail("timeout before enough oscillation cycles");
                return None;
            }
        }
        if let Some(limit) = self.config.max_process_amplitude {
            if (pv - setpoint).abs() > limit {
                self.fail("process amplitude limit exceeded");
                return None;
            }
        }

        self.cycles.cycle_max = self.cycles.cycle_max.max(pv);
        self.cycles.cycle_min = self.cycles.cycle_min.min(pv);

        // Relay with hysteresis: drop the output once the process rises
        // through the upper band, raise it below the lower band.
        if self.relay_high && pv > setpoint + self.config.hysteresis {
            self.relay_high = false;
        } else if !self.relay_high && pv < setpoint - self.config.hysteresis {
            self.relay_high = true;
            self.on_rise(now);
        }

        match self.phase {
            TunePhase::AnalyzingData => {
                self.analyze();
                None
            }
            TunePhase::RelayTest => Some(if self.relay_high {
                center + self.config.relay_amplitude
            } else {
                center - self.config.relay_amplitude
            }),
            _ => None,
        }
    }

    fn on_rise(&mut self, now: DateTime<Utc>) {
        if !self.cycles.rises.is_empty() {
            let p2p = self.cycles.cycle_max - self.cycles.cycle_min;
            self.cycles.amplitudes.push(p2p);
        }
        self.cycles.rises.push(now);
        self.cycles.cycle_max = f64::MIN;
        self.cycles.cycle_min = f64::MAX;

        let completed = self.cycles.amplitudes.len() as u32;
        if completed >= self.config.min_cycles && self.recent_cycles_consistent() {
            self.phase = TunePhase::AnalyzingData;
        } else if completed >= self.config.max_cycles {
            self.fail("cycle limit reached without consistent oscillation");
        }
    }

    /// The last `min_cycles` periods and amplitudes must repeat closely
    /// before the oscillation counts as converged.
    fn recent_cycles_consistent(&self) -> bool {
        let n = self.config.min_cycles as usize;
        let periods: Vec<f64> = self
            .cycles
            .rises
            .windows(2)
            .map(|w| elapsed_secs(w[0], w[1]))
            .collect();
        if periods.len() < n || self.cycles.amplitudes.len() < n {
            return false;
        }
        let recent_periods = &periods[periods.len() - n..];
        let recent_amps = &self.cycles.amplitudes[self.cycles.amplitudes.len() - n..];
        consistency(recent_periods) >= MIN_CYCLE_CONSISTENCY
            && consistency(recent_amps) >= MIN_CYCLE_CONSISTENCY
    }

    fn analyze(&mut self) {
        let periods: Vec<f64> = self
            .cycles
            .rises
            .windows(2)
            .map(|w| elapsed_secs(w[0], w[1]))
            .collect();
        if periods.is_empty() || self.cycles.amplitudes.is_empty() {
            self.fail("no complete cycles recorded");
            return;
        }

        let pu = mean(&periods);
        let p2p = mean(&self.cycles.amplitudes);
        if pu <= 0.0 || p2p <= 0.0 {
            self.fail("degenerate oscillation measurements");
            return;
        }

        let a = p2p / 2.0;
        let (ku, kp, ki, kd) = ziegler_nichols(self.config.relay_amplitude, pu, a);
        let confidence = consistency(&periods).min(consistency(&self.cycles.amplitudes));

        info!(
            ku,
            pu,
            kp,
            ki,
            kd,
            confidence,
            "autotune analysis complete"
        );
        self.result = Some(TuneResult {
            ultimate_gain: ku,
            ultimate_period: pu,
            kp,
            ki,
            kd,
            confidence,
            cycles: self.cycles.amplitudes.len() as u32,
        });
        self.phase = TunePhase::Completed;
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// 1 minus the coefficient of variation, clamped to 0..1. A perfectly
/// repeating oscillation scores 1.0.
fn consistency(values: &[f64]) -> f64 {
    let m = mean(values);
    if values.len() < 2 || m == 0.0 {
        return 1.0;
    }
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    (1.0 - var.sqrt() / m).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ziegler_nichols_gains() {
        // Relay amplitude 20, 60s period, peak-to-peak 10 (a = 5)
        let (ku, kp, ki, kd) = ziegler_nichols(20.0, 60.0, 5.0);
        assert!((ku - 5.0930).abs() < 1e-3);
        assert!((kp - 3.0558).abs() < 1e-3);
        assert!((ki - 0.10186).abs() < 1e-4);
        assert!((kd - 22.9183).abs() < 1e-3);
    }

    #[test]
    fn test_relay_switches_with_hysteresis() {
        let mut config = AutotuneConfig::default();
        config.hysteresis = 1.0;
        config.relay_amplitude = 10.0;
        let mut tuner = AutoTuner::new(config, (1.0, 0.0, 0.0));
        tuner.start();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        // Below setpoint the relay starts high
        let out = tuner.step(48.0, 50.0, 50.0, t0).unwrap();
        assert_eq!(out, 60.0);

        // Inside the band it holds
        let out = tuner.step(50.5, 50.0, 50.0, t0 + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(out, 60.0);

        // Crossing the upper band drops the output
        let out = tuner.step(51.5, 50.0, 50.0, t0 + chrono::Duration::seconds(2)).unwrap();
        assert_eq!(out, 40.0);
    }

    #[test]
    fn test_full_relay_test_converges() {
        let mut config = AutotuneConfig::default();
        config.relay_amplitude = 20.0;
        config.hysteresis = 1.0;
        config.min_cycles = 4;
        let mut tuner = AutoTuner::new(config, (1.0, 0.0, 0.0));
        tuner.start();

        // Synthetic process oscillating around the setpoint with a 60s
        // period and amplitude 5.
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let setpoint = 50.0;
        let mut i = 0i64;
        while tuner.is_running() && i < 600 {
            let t = t0 + chrono::Duration::seconds(i);
            let pv = setpoint - 5.0 * (2.0 * PI * i as f64 / 60.0).cos();
            tuner.step(pv, setpoint, 50.0, t);
            i += 1;
        }

        assert_eq!(tuner.phase(), TunePhase::Completed);
        let result = tuner.result().unwrap();
        assert!((result.ultimate_period - 60.0).abs() < 2.0);
        assert!((result.ultimate_gain - 5.093).abs() < 0.5);
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_inconsistent_cycles_fail_at_cycle_limit() {
        let mut config = AutotuneConfig::default();
        config.hysteresis = 1.0;
        config.min_cycles = 2;
        config.max_cycles = 4;
        let mut tuner = AutoTuner::new(config, (1.0, 0.0, 0.0));
        tuner.start();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        // Alternate 5s and 50s between relay rises: the oscillation never
        // repeats, so the test must fail once max_cycles is reached instead
        // of completing at min_cycles.
        let mut t = t0;
        tuner.step(60.0, 50.0, 50.0, t);
        for (i, gap) in [1i64, 5, 50, 5, 50].iter().enumerate() {
            t = t + chrono::Duration::seconds(*gap);
            tuner.step(40.0, 50.0, 50.0, t);
            if i < 4 {
                assert!(tuner.is_running(), "ended early after rise {}", i + 1);
                t = t + chrono::Duration::seconds(1);
                tuner.step(60.0, 50.0, 50.0, t);
            }
        }
        assert_eq!(tuner.phase(), TunePhase::Failed);
    }

    #[test]
    fn test_timeout_fails_the_test() {
        let mut config = AutotuneConfig::default();
        config.timeout_secs = 10.0;
        let mut tuner = AutoTuner::new(config, (1.0, 0.0, 0.0));
        tuner.start();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        tuner.step(49.0, 50.0, 50.0, t0);
        tuner.step(49.0, 50.0, 50.0, t0 + chrono::Duration::seconds(11));
        assert_eq!(tuner.phase(), TunePhase::Failed);
    }

    #[test]
    fn test_amplitude_limit_fails_the_test() {
        let mut config = AutotuneConfig::default();
        config.max_process_amplitude = Some(10.0);
        let mut tuner = AutoTuner::new(config, (1.0, 0.0, 0.0));
        tuner.start();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        tuner.step(49.0, 50.0, 50.0, t0);
        tuner.step(65.0, 50.0, 50.0, t0 + chrono::Duration::seconds(1));
        assert_eq!(tuner.phase(), TunePhase::Failed);
    }

    #[test]
    fn test_cancel_aborts_and_keeps_original_gains() {
        let mut tuner = AutoTuner::new(AutotuneConfig::default(), (2.5, 0.3, 0.1));
        tuner.start();
        let t0 = Utc::now();
        tuner.step(49.0, 50.0, 50.0, t0);
        tuner.cancel();
        assert_eq!(tuner.phase(), TunePhase::Aborted);
        assert_eq!(tuner.original_gains(), (2.5, 0.3, 0.1));
        assert!(tuner.step(49.0, 50.0, 50.0, t0 + chrono::Duration::seconds(1)).is_none());
    }
}
