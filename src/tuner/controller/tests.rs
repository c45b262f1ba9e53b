use super::*;
use crate::audit::MemoryAuditSink;
use crate::device::traits::MockDeviceClient;
use crate::device::virtual_device::{VirtualDevice, VirtualDeviceConfig};
use crate::profile::ProfileResolver;

fn gamma_bounds() -> TuningBounds {
    ProfileResolver::default().resolve(Some("BM1370"), None).bounds
}

fn test_settings() -> AutoTuneSettings {
    AutoTuneSettings {
        optimize_every_cycles: 0,
        ..AutoTuneSettings::default()
    }
}

fn sample(hashrate: f64, temp: f64, vr_temp: f64, settings: DeviceSettings) -> TelemetrySample {
    TelemetrySample {
        timestamp: Utc::now(),
        hashrate: Some(hashrate),
        chip_temp: Some(temp),
        vr_temp: Some(vr_temp),
        power: Some(18.0),
        input_voltage: Some(5000.0),
        frequency: Some(settings.frequency),
        core_voltage: Some(settings.core_voltage),
    }
}

fn history_with(samples: &[TelemetrySample]) -> TelemetryHistory {
    TelemetryHistory::from_samples(120, samples.iter().cloned())
}

fn virtual_tuner(settings: AutoTuneSettings) -> (AutoTuner, Arc<VirtualDevice>, Arc<MemoryAuditSink>) {
    let device = Arc::new(VirtualDevice::new("gamma", VirtualDeviceConfig::default()));
    let audit = Arc::new(MemoryAuditSink::new());
    let tuner = AutoTuner::new("gamma", device.clone(), gamma_bounds(), settings, audit.clone());
    (tuner, device, audit)
}

#[tokio::test]
async fn test_disabled_and_missing_telemetry_are_noops() {
    let (mut tuner, device, _) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(600, 1200);

    let mut partial = sample(1000.0, 65.0, 50.0, current);
    partial.chip_temp = None;
    let outcome = tuner.tick(Utc::now(), &partial, &history_with(&[])).await;
    assert_eq!(outcome, TickOutcome::MissingTelemetry(vec!["chip_temp"]));

    tuner.set_enabled(false);
    let outcome = tuner.tick(Utc::now(), &sample(1000.0, 65.0, 50.0, current), &history_with(&[])).await;
    assert_eq!(outcome, TickOutcome::Disabled);

    assert!(device.applied_settings().await.is_empty());
    assert_eq!(tuner.state().cycle_count, 0);
}

// 芯片 65°C、目标 60°C、VR 50°C：频率和电压同时下调一步
#[tokio::test]
async fn test_hot_chip_lowers_frequency_and_voltage() {
    let (mut tuner, device, audit) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(600, 1200);
    let s = sample(1200.0, 65.0, 50.0, current);

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;

    let expected = DeviceSettings::new(575, 1190);
    match outcome {
        TickOutcome::Adjusted { from, to, reason } => {
            assert_eq!(from, current);
            assert_eq!(to, expected);
            assert!(reason.contains("above target"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(device.applied_settings().await, vec![expected]);
    assert_eq!(audit.count(AuditKind::TuningAction), 1);
}

#[tokio::test]
async fn test_hot_vr_lowers_both_and_clamps_to_bounds() {
    let (mut tuner, device, _) = virtual_tuner(test_settings());
    // 电压已接近下限，只能下调到下限
    let current = DeviceSettings::new(450, 1005);
    let s = sample(900.0, 55.0, 75.0, current);

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;

    match outcome {
        TickOutcome::Adjusted { to, .. } => {
            assert_eq!(to, DeviceSettings::new(425, 1000));
            assert!(tuner.bounds().contains(to));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(device.applied_settings().await.len(), 1);
}

#[tokio::test]
async fn test_decrease_at_floor_is_unchanged() {
    let (mut tuner, device, _) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(400, 1000);
    let s = sample(800.0, 66.0, 50.0, current);

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;
    assert!(matches!(outcome, TickOutcome::Unchanged(_)));
    assert!(device.applied_settings().await.is_empty());
}

// 输入电压 4850mV：无论温度如何都立即切到安全设置
#[tokio::test]
async fn test_low_input_voltage_forces_safe_defaults() {
    let (mut tuner, device, audit) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(700, 1250);
    let mut s = sample(1400.0, 50.0, 50.0, current);
    s.input_voltage = Some(4850.0);

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;

    match outcome {
        TickOutcome::SafetyClamp { error, settings } => {
            assert_eq!(settings, DeviceSettings::new(525, 1150));
            assert_eq!(error.code(), "safety_input_voltage_low");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(device.applied_settings().await, vec![DeviceSettings::new(525, 1150)]);
    assert_eq!(audit.count(AuditKind::SafetyTrip), 1);

    let pending = tuner.state().pending_verification.as_ref().unwrap();
    assert_eq!(pending.previous, current);
    assert_eq!(pending.hashrate_before_change, 1400.0);
    assert!(pending.protective);
}

#[tokio::test]
async fn test_safety_hold_when_already_safe() {
    let (mut tuner, device, _) = virtual_tuner(test_settings());
    let mut s = sample(1000.0, 50.0, 50.0, DeviceSettings::new(525, 1150));
    s.input_voltage = Some(4700.0);

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;
    assert!(matches!(outcome, TickOutcome::SafetyHold(_)));
    assert!(device.applied_settings().await.is_empty());
}

#[tokio::test]
async fn test_critical_chip_temperature_trips_interlock() {
    let (mut tuner, _, _) = virtual_tuner(test_settings());
    let s = sample(1000.0, 71.0, 50.0, DeviceSettings::new(650, 1250));

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;
    match outcome {
        TickOutcome::SafetyClamp { error, .. } => assert_eq!(error.code(), "safety_chip_temperature"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

// 30 个相同的非零算力：只重启一次，计数器清零
#[tokio::test]
async fn test_flatline_restarts_once_and_resets_counters() {
    let (mut tuner, device, audit) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(525, 1150);
    let s = sample(1071.0, 59.0, 50.0, current);
    let history = history_with(&vec![s.clone(); 30]);

    // 先积累一些状态
    let warmup = sample(1071.5, 59.0, 50.0, current);
    tuner.tick(Utc::now() - ChronoDuration::hours(1), &warmup, &history_with(&[warmup.clone()])).await;
    assert!(tuner.state().cycle_count > 0);

    let outcome = tuner.tick(Utc::now(), &s, &history).await;

    assert_eq!(outcome, TickOutcome::Restarted);
    assert_eq!(device.restart_count().await, 1);
    assert_eq!(tuner.state().cycle_count, 0);
    assert_eq!(tuner.state().voltage_stuck_cycles, 0);
    assert_eq!(tuner.state().restarts, 1);
    assert_eq!(audit.count(AuditKind::Restart), 1);
}

#[tokio::test]
async fn test_cooldown_blocks_following_tick() {
    let (mut tuner, device, _) = virtual_tuner(test_settings());
    let now = Utc::now();
    let s = sample(1200.0, 65.0, 50.0, DeviceSettings::new(600, 1200));
    tuner.tick(now, &s, &history_with(&[s.clone()])).await;

    let later = sample(1150.0, 64.0, 50.0, DeviceSettings::new(575, 1190));
    let outcome = tuner
        .tick(now + ChronoDuration::seconds(30), &later, &history_with(&[later.clone()]))
        .await;
    assert_eq!(outcome, TickOutcome::Cooldown);
    assert_eq!(device.applied_settings().await.len(), 1);
}

// 暂停在目标温度进入，只有离开滞回带 (任一方向) 才退出
#[tokio::test]
async fn test_pause_exits_symmetrically() {
    let (mut tuner, _, _) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(600, 1200);
    let now = Utc::now();

    let at_target = sample(1200.0, 60.0, 50.0, current);
    assert_eq!(tuner.tick(now, &at_target, &history_with(&[])).await, TickOutcome::Paused);
    assert!(tuner.state().tuner_paused);

    // 偏离小于滞回带：保持暂停
    for temp in [61.0, 59.0, 61.9, 58.1] {
        let s = sample(1200.0, temp, 50.0, current);
        assert_eq!(tuner.tick(now, &s, &history_with(&[])).await, TickOutcome::Paused);
    }

    // 温度下降离开滞回带：恢复并提升
    let cooler = sample(1200.0, 58.0, 50.0, current);
    let outcome = tuner.tick(now, &cooler, &history_with(&[])).await;
    assert!(!tuner.state().tuner_paused);
    match outcome {
        TickOutcome::Adjusted { to, .. } => assert!(to.frequency > current.frequency),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_exits_when_temperature_rises() {
    let (mut tuner, _, _) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(600, 1200);
    let now = Utc::now();

    let at_target = sample(1200.0, 60.0, 50.0, current);
    assert_eq!(tuner.tick(now, &at_target, &history_with(&[])).await, TickOutcome::Paused);

    let hotter = sample(1200.0, 62.0, 50.0, current);
    match tuner.tick(now, &hotter, &history_with(&[])).await {
        TickOutcome::Adjusted { to, .. } => {
            assert!(to.frequency < current.frequency);
            assert!(to.core_voltage < current.core_voltage);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!tuner.state().tuner_paused);
}

#[tokio::test]
async fn test_push_raises_frequency_and_voltage() {
    let (mut tuner, _, _) = virtual_tuner(test_settings());
    let current = DeviceSettings::new(525, 1150);
    let s = sample(1050.0, 50.0, 45.0, current);

    match tuner.tick(Utc::now(), &s, &history_with(&[])).await {
        TickOutcome::Adjusted { to, .. } => assert_eq!(to, DeviceSettings::new(550, 1160)),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(tuner.state().pending_stuck_check, Some(1050.0));
}

#[tokio::test]
async fn test_voltage_stuck_enters_frequency_boost() {
    let settings = AutoTuneSettings {
        optimize_every_cycles: 0,
        verification_wait_secs: 30,
        cooldown_secs: 60,
        ..AutoTuneSettings::default()
    };
    let (mut tuner, _, _) = virtual_tuner(settings);
    let mut now = Utc::now();
    let mut current = DeviceSettings::new(500, 1100);

    // 三次升压都没有带来算力提升
    for _ in 0..3 {
        let s = sample(1000.0, 50.0, 45.0, current);
        match tuner.tick(now, &s, &history_with(&[])).await {
            TickOutcome::Adjusted { to, .. } => current = to,
            other => panic!("unexpected outcome: {:?}", other),
        }
        now += ChronoDuration::seconds(30);
        let s = sample(1000.0, 50.0, 45.0, current);
        assert!(matches!(
            tuner.tick(now, &s, &history_with(&[])).await,
            TickOutcome::Verified(_)
        ));
        now += ChronoDuration::seconds(60);
    }

    let s = sample(1000.0, 50.0, 45.0, current);
    let outcome = tuner.tick(now, &s, &history_with(&[])).await;
    assert!(tuner.state().frequency_boost_active);
    match outcome {
        TickOutcome::Adjusted { from, to, .. } => {
            assert_eq!(to.core_voltage, from.core_voltage);
            assert!(to.frequency > from.frequency);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(tuner.state().boost_baseline_hashrate, Some(1000.0));
}

#[tokio::test]
async fn test_every_change_schedules_exactly_one_verification() {
    let settings = AutoTuneSettings {
        optimize_every_cycles: 0,
        verification_wait_secs: 120,
        cooldown_secs: 60,
        ..AutoTuneSettings::default()
    };
    let (mut tuner, device, _) = virtual_tuner(settings);
    let mut now = Utc::now();
    let mut current = DeviceSettings::new(600, 1200);

    let temps = [65.0, 64.0, 63.5, 50.0, 66.0, 61.0, 50.0, 59.0];
    for temp in temps {
        let s = sample(1200.0, temp, 50.0, current);
        if let TickOutcome::Adjusted { to, .. } = tuner.tick(now, &s, &history_with(&[])).await {
            current = to;
        }
        assert!(tuner.bounds().contains(current));
        now += ChronoDuration::seconds(70);
    }

    let state = tuner.state();
    assert_eq!(state.applied_changes, device.applied_settings().await.len() as u64);
    assert_eq!(state.applied_changes, state.verifications_scheduled);
    let outstanding = state.pending_verification.is_some() as u64;
    assert_eq!(state.verifications_scheduled, state.verifications_cleared + outstanding);
}

#[tokio::test]
async fn test_verification_reverts_on_drop() {
    let mut mock = MockDeviceClient::new();
    mock.expect_apply_settings()
        .withf(|s| *s == DeviceSettings::new(550, 1160))
        .times(1)
        .returning(|_| Ok(()));
    mock.expect_apply_settings()
        .withf(|s| *s == DeviceSettings::new(525, 1150))
        .times(1)
        .returning(|_| Ok(()));

    let audit = Arc::new(MemoryAuditSink::new());
    let mut tuner = AutoTuner::new("gamma", Arc::new(mock), gamma_bounds(), test_settings(), audit.clone());
    let now = Utc::now();

    let s = sample(1000.0, 50.0, 45.0, DeviceSettings::new(525, 1150));
    assert!(matches!(tuner.tick(now, &s, &history_with(&[])).await, TickOutcome::Adjusted { .. }));

    let later = now + ChronoDuration::seconds(90);
    let s = sample(900.0, 52.0, 45.0, DeviceSettings::new(550, 1160));
    match tuner.tick(later, &s, &history_with(&[])).await {
        TickOutcome::Verified(VerificationVerdict::Revert { to, .. }) => {
            assert_eq!(to, DeviceSettings::new(525, 1150));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(audit.count(AuditKind::Verification), 1);
    // 回滚本身也安排了一次 (不可回滚的) 校验
    assert!(tuner.state().pending_verification.as_ref().unwrap().protective);
}

#[tokio::test]
async fn test_apply_failure_is_a_noop() {
    let mut mock = MockDeviceClient::new();
    mock.expect_apply_settings().times(1).returning(|_| {
        Err(DeviceError::Unreachable {
            device_id: "gamma".to_string(),
            error: "connection refused".to_string(),
        })
    });

    let mut tuner = AutoTuner::new(
        "gamma",
        Arc::new(mock),
        gamma_bounds(),
        test_settings(),
        Arc::new(MemoryAuditSink::new()),
    );
    let s = sample(1000.0, 65.0, 45.0, DeviceSettings::new(600, 1200));

    assert!(matches!(
        tuner.tick(Utc::now(), &s, &history_with(&[])).await,
        TickOutcome::DeviceFailure(_)
    ));
    assert!(tuner.state().pending_verification.is_none());
    assert!(tuner.state().last_adjustment_time.is_none());
}

#[tokio::test]
async fn test_closed_capability_never_applies() {
    let mock = MockDeviceClient::new();
    let bounds = ProfileResolver::default()
        .resolve(Some("BM1366"), Some("Antminer S19"))
        .bounds;
    let mut tuner = AutoTuner::new("s19", Arc::new(mock), bounds, test_settings(), Arc::new(MemoryAuditSink::new()));

    let s = sample(1000.0, 80.0, 50.0, DeviceSettings::new(500, 1300));
    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[])).await;
    assert_eq!(outcome, TickOutcome::NotPermitted(TuningCapability::Closed));
}

#[tokio::test]
async fn test_optimizer_applies_lower_voltage_point() {
    let settings = AutoTuneSettings {
        optimize_every_cycles: 1,
        optimizer_min_samples: 3,
        ..AutoTuneSettings::default()
    };
    let (mut tuner, device, audit) = virtual_tuner(settings);

    let history = history_with(&[
        sample(1000.0, 60.0, 50.0, DeviceSettings::new(600, 1250)),
        sample(990.0, 60.5, 50.0, DeviceSettings::new(575, 1150)),
        sample(1000.0, 59.5, 50.0, DeviceSettings::new(600, 1250)),
    ]);
    let current = sample(1000.0, 60.0, 50.0, DeviceSettings::new(600, 1250));

    match tuner.tick(Utc::now(), &current, &history).await {
        TickOutcome::Adjusted { to, reason, .. } => {
            assert_eq!(to, DeviceSettings::new(575, 1150));
            assert!(reason.starts_with("Auto-optimize"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(device.applied_settings().await, vec![DeviceSettings::new(575, 1150)]);
    assert_eq!(audit.count(AuditKind::OptimizerDecision), 1);
}

// 芯片测温失败 (-1°C) 不能当作低温继续加压
#[tokio::test]
async fn test_failed_temperature_sensor_forces_safe_defaults() {
    let (mut tuner, device, audit) = virtual_tuner(test_settings());
    let s = sample(1300.0, -1.0, 50.0, DeviceSettings::new(700, 1250));

    let outcome = tuner.tick(Utc::now(), &s, &history_with(&[s.clone()])).await;
    match outcome {
        TickOutcome::SafetyClamp { error, settings } => {
            assert_eq!(error.code(), "safety_sensor_fault");
            assert_eq!(settings, DeviceSettings::new(525, 1150));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(device.applied_settings().await, vec![DeviceSettings::new(525, 1150)]);
    assert_eq!(audit.count(AuditKind::SafetyTrip), 1);
}
