use chrono::{Duration, TimeZone, Utc};
use vela::*;

#[test]
fn test_totalizer_integrates_flow() {
    let yaml = r#"
points:
  - id: flow
    point_type: analog_input
  - id: volume
    point_type: analog_output

blocks:
  - name: volume_total
    type: totalizer
    interval_secs: 1.0
    input:
      point: flow
    output:
      point: volume
    mode: rate_integration
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let flow = SourceRef::Point("flow".into());
    let volume = SourceRef::Point("volume".into());
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    engine.store().write(&flow, Value::Float(5.0), t0, None).unwrap();
    engine.step(t0).unwrap();

    // 5 rising to 15 over one second adds the trapezoid (5+15)/2 * 1
    let t1 = t0 + Duration::seconds(1);
    engine.store().write(&flow, Value::Float(15.0), t1, None).unwrap();
    engine.step(t1).unwrap();

    assert!((engine.store().get_float(&volume).unwrap() - 10.0).abs() < 1e-9);
}

#[test]
fn test_schedule_priority_through_engine() {
    let yaml = r#"
points:
  - id: setpoint
    point_type: analog_output

blocks:
  - name: zone_schedule
    type: schedule
    interval_secs: 60.0
    output:
      point: setpoint
    default_value:
      type: float
      value: 16.0
    entries:
      - days: [monday, tuesday, wednesday, thursday, friday]
        start: "08:00:00"
        end: "20:00:00"
        priority: 1
        value:
          type: float
          value: 21.0
      - days: [monday, tuesday, wednesday, thursday, friday]
        start: "12:00:00"
        end: "13:00:00"
        priority: 5
        value:
          type: float
          value: 18.0
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let setpoint = SourceRef::Point("setpoint".into());

    // Wednesday 12:30, the narrow high priority entry wins
    let noon = Utc.with_ymd_and_hms(2026, 1, 7, 12, 30, 0).unwrap();
    engine.step(noon).unwrap();
    assert_eq!(engine.store().get_float(&setpoint).unwrap(), 18.0);

    let afternoon = Utc.with_ymd_and_hms(2026, 1, 7, 15, 0, 0).unwrap();
    engine.step(afternoon).unwrap();
    assert_eq!(engine.store().get_float(&setpoint).unwrap(), 21.0);

    let night = Utc.with_ymd_and_hms(2026, 1, 7, 23, 0, 0).unwrap();
    engine.step(night).unwrap();
    assert_eq!(engine.store().get_float(&setpoint).unwrap(), 16.0);
}

#[test]
fn test_cascade_outer_runs_before_inner() {
    let yaml = r#"
points:
  - id: room_temp
    point_type: analog_input
  - id: supply_temp
    point_type: analog_input
  - id: supply_sp
    point_type: analog_output
  - id: valve
    point_type: analog_output

blocks:
  - name: room_loop
    type: pid
    interval_secs: 1.0
    input:
      point: room_temp
    setpoint: 21.0
    output:
      point: supply_sp
    kp: 2.0
    cascade_level: 0

  - name: supply_loop
    type: pid
    interval_secs: 1.0
    input:
      point: supply_temp
    setpoint:
      point: supply_sp
    output:
      point: valve
    kp: 1.0
    cascade_level: 1
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    engine
        .store()
        .write(&SourceRef::Point("room_temp".into()), Value::Float(16.0), t0, None)
        .unwrap();
    engine
        .store()
        .write(&SourceRef::Point("supply_temp".into()), Value::Float(0.0), t0, None)
        .unwrap();
    engine.step(t0).unwrap();

    // The outer loop wrote 2.0 * (21 - 16) = 10 this same tick, and the
    // inner loop consumed it: 1.0 * (10 - 0) = 10.
    assert_eq!(
        engine.store().get_float(&SourceRef::Point("supply_sp".into())).unwrap(),
        10.0
    );
    assert_eq!(
        engine.store().get_float(&SourceRef::Point("valve".into())).unwrap(),
        10.0
    );
}

#[test]
fn test_disabled_block_is_idempotent() {
    let yaml = r#"
points:
  - id: flow
    point_type: analog_input
  - id: volume
    point_type: analog_output

blocks:
  - name: volume_total
    type: totalizer
    interval_secs: 1.0
    enabled: false
    input:
      point: flow
    output:
      point: volume
    mode: rate_integration
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    engine
        .store()
        .write(&SourceRef::Point("flow".into()), Value::Float(100.0), t0, None)
        .unwrap();

    for i in 0..10 {
        engine.step(t0 + Duration::seconds(i)).unwrap();
    }
    let stats = engine.stats();
    assert_eq!(stats.run_count, 0);
    assert_eq!(stats.error_count, 0);
    assert_eq!(
        engine.store().get_float(&SourceRef::Point("volume".into())).unwrap(),
        0.0
    );
}

#[test]
fn test_state_snapshot_survives_restart() {
    let yaml = r#"
points:
  - id: flow
    point_type: analog_input
  - id: volume
    point_type: analog_output

blocks:
  - name: volume_total
    type: totalizer
    interval_secs: 1.0
    input:
      point: flow
    output:
      point: volume
    mode: rate_integration
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config.clone()).unwrap();
    let flow = SourceRef::Point("flow".into());
    let volume = SourceRef::Point("volume".into());
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    engine.store().write(&flow, Value::Float(10.0), t0, None).unwrap();
    for i in 0..5 {
        engine.step(t0 + Duration::seconds(i)).unwrap();
    }
    let total_before = engine.store().get_float(&volume).unwrap();
    assert!(total_before > 0.0);

    // Persist, build a fresh engine, restore
    let store = MemoryStateStore::new();
    store.save("engine", &engine.snapshot_state().unwrap()).unwrap();

    let mut engine = Engine::new(config).unwrap();
    engine
        .restore_state(store.load("engine").unwrap().unwrap())
        .unwrap();

    engine.store().write(&flow, Value::Float(10.0), t0 + Duration::seconds(5), None).unwrap();
    engine.step(t0 + Duration::seconds(5)).unwrap();
    let total_after = engine.store().get_float(&volume).unwrap();
    assert!(total_after >= total_before);
}

#[test]
fn test_alarm_raises_through_engine() {
    let yaml = r#"
engine:
  alarm_interval_secs: 1.0

points:
  - id: temp
    point_type: analog_input
  - id: horn
    point_type: digital_output

alarms:
  - name: high_temp
    priority: critical
    condition:
      kind: compare
      value1:
        point: temp
      op: higher
      value2: 80.0
      hysteresis: 1.0
    message: temperature high
    external:
      - target:
          point: horn
        value: true
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let temp = SourceRef::Point("temp".into());
    let horn = SourceRef::Point("horn".into());
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    engine.store().write(&temp, Value::Float(85.0), t0, None).unwrap();
    engine.step(t0).unwrap();
    assert!(engine.alarms().is_active("high_temp"));
    assert!(engine.store().get_bool(&horn).unwrap());

    let t1 = t0 + Duration::seconds(2);
    engine.store().write(&temp, Value::Float(70.0), t1, None).unwrap();
    engine.step(t1).unwrap();
    assert!(!engine.alarms().is_active("high_temp"));
    assert!(!engine.store().get_bool(&horn).unwrap());
    assert_eq!(engine.alarms().history().count(), 2);
}

#[test]
fn test_formula_chain_through_engine() {
    let yaml = r#"
points:
  - id: outdoor
    point_type: analog_input
  - id: heating_curve
    point_type: analog_output

blocks:
  - name: curve
    type: formula
    interval_secs: 1.0
    inputs:
      out_t:
        point: outdoor
    output:
      point: heating_curve
    expression: "clamp(60 - 1.5 * [out_t], 20, 80)"
    decimal_places: 1
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let mut engine = Engine::new(config).unwrap();
    let outdoor = SourceRef::Point("outdoor".into());
    let curve = SourceRef::Point("heating_curve".into());
    let t0 = Utc::now();

    engine.store().write(&outdoor, Value::Float(-5.0), t0, None).unwrap();
    engine.step(t0).unwrap();
    assert_eq!(engine.store().get_float(&curve).unwrap(), 67.5);

    let t1 = t0 + Duration::seconds(1);
    engine.store().write(&outdoor, Value::Float(40.0), t1, None).unwrap();
    engine.step(t1).unwrap();
    assert_eq!(engine.store().get_float(&curve).unwrap(), 20.0);
}
