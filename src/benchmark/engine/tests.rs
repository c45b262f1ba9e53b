use super::*;
use crate::audit::MemoryAuditSink;
use crate::control::ControlAction;
use crate::device::virtual_device::{VirtualDevice, VirtualDeviceConfig};
use crate::profile::ProfileResolver;
use chrono::Utc;
use std::sync::Mutex;

fn fast_config() -> BenchmarkConfig {
    BenchmarkConfig {
        test_duration_secs: 105,
        sample_interval_secs: 15,
        stabilization_secs: 10,
        overclock_test_duration_secs: 105,
        overclock_stabilization_secs: 5,
        ..BenchmarkConfig::default()
    }
}

fn gamma_bounds() -> TuningBounds {
    ProfileResolver::default().resolve(Some("BM1370"), None).bounds
}

fn quiet_device(config: VirtualDeviceConfig) -> Arc<VirtualDevice> {
    Arc::new(VirtualDevice::new("gamma", VirtualDeviceConfig { noise: 0.0, ..config }))
}

fn scripted(temp: f64, hashrate: f64) -> TelemetrySample {
    TelemetrySample {
        hashrate: Some(hashrate),
        chip_temp: Some(temp),
        vr_temp: Some(50.0),
        power: Some(20.0),
        input_voltage: Some(5000.0),
        frequency: Some(525),
        core_voltage: Some(1150),
        ..TelemetrySample::empty(Utc::now())
    }
}

#[derive(Default)]
struct Recorder {
    samples: Mutex<usize>,
    iterations: Mutex<Vec<u32>>,
    progress: Mutex<Vec<BenchmarkProgress>>,
    finished: Mutex<usize>,
}

impl BenchmarkListener for Recorder {
    fn on_progress(&self, progress: &BenchmarkProgress) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn on_sample(&self, _device_id: &str, _sample: &TelemetrySample) {
        *self.samples.lock().unwrap() += 1;
    }

    fn on_iteration(&self, _device_id: &str, iteration: u32, _result: &BenchmarkResult) {
        self.iterations.lock().unwrap().push(iteration);
    }

    fn on_finished(&self, _summary: &BenchmarkSummary) {
        *self.finished.lock().unwrap() += 1;
    }
}

struct CancelOnFirstSample(CancelHandle);

impl BenchmarkListener for CancelOnFirstSample {
    fn on_sample(&self, _device_id: &str, _sample: &TelemetrySample) {
        self.0.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_quick_mode_single_result_without_restart() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), fast_config())
        .with_listener(recorder.clone())
        .with_audit(audit.clone());

    let summary = engine.run(BenchmarkMode::Quick).await;

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].samples.len(), 7);
    assert!(summary.results[0].stable);
    assert_eq!(summary.original_settings, Some(DeviceSettings::new(525, 1150)));
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(525, 1150)));

    // 不重启、不下发设置、不等待稳定
    assert_eq!(device.restart_count().await, 0);
    assert!(device.applied_settings().await.is_empty());
    assert_eq!(device.telemetry_reads().await, 8);

    assert_eq!(*recorder.samples.lock().unwrap(), 7);
    assert_eq!(*recorder.iterations.lock().unwrap(), vec![1]);
    assert_eq!(*recorder.finished.lock().unwrap(), 1);
    assert_eq!(audit.count(AuditKind::BenchmarkTransition), 2);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_progress_events_are_never_throttled() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let engine = BenchmarkEngine::new("gamma", device, gamma_bounds(), fast_config()).with_listener(recorder.clone());

    engine.run(BenchmarkMode::Quick).await;

    let progress = recorder.progress.lock().unwrap();
    let terminal: Vec<_> = progress.iter().filter(|p| p.terminal).collect();
    // 开始、迭代完成、结束
    assert_eq!(terminal.len(), 3);
    assert!(terminal[2].message.starts_with("Finished"));
}

#[tokio::test(start_paused = true)]
async fn test_optimize_climbs_to_frequency_ceiling() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let config = BenchmarkConfig {
        max_frequency_mhz: 600,
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config);

    let summary = engine.run(BenchmarkMode::Optimize).await;

    let frequencies: Vec<u32> = summary.results.iter().map(|r| r.frequency).collect();
    assert_eq!(frequencies, vec![525, 550, 575, 600]);
    assert!(summary.results.iter().all(|r| r.stable));
    assert_eq!(summary.stop_reason, StopReason::FrequencyCeiling);
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(600, 1150)));
    assert_eq!(summary.top_by_hashrate[0].frequency, 600);

    assert_eq!(device.current_settings().await, DeviceSettings::new(600, 1150));
    assert_eq!(device.restart_count().await, 4);
    assert_eq!(device.applied_settings().await.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_optimize_unstable_point_lowers_frequency_and_raises_voltage() {
    let device = quiet_device(VirtualDeviceConfig {
        initial_settings: DeviceSettings::new(600, 1050),
        ..VirtualDeviceConfig::default()
    });
    let config = BenchmarkConfig {
        max_frequency_mhz: 600,
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config);

    let summary = engine.run(BenchmarkMode::Optimize).await;

    assert!(!summary.results[0].stable);
    assert_eq!(summary.results[1].settings(), DeviceSettings::new(575, 1070));
    let voltages: Vec<u32> = summary.results.iter().map(|r| r.core_voltage).collect();
    assert!(voltages.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(summary.stop_reason, StopReason::FrequencyCeiling);
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(600, 1110)));
    assert_eq!(device.current_settings().await, DeviceSettings::new(600, 1110));
}

#[tokio::test(start_paused = true)]
async fn test_efficiency_reapplies_lowest_joules_per_terahash() {
    let device = quiet_device(VirtualDeviceConfig {
        initial_settings: DeviceSettings::new(600, 1050),
        ..VirtualDeviceConfig::default()
    });
    let config = BenchmarkConfig {
        max_frequency_mhz: 600,
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config);

    let summary = engine.run(BenchmarkMode::Efficiency).await;

    let applied = summary.applied_settings.unwrap();
    assert_eq!(applied.core_voltage, 1090);
    assert_eq!(summary.top_by_efficiency[0].core_voltage, 1090);
    assert_eq!(device.current_settings().await, applied);
    // 最后一次下发就是写回
    assert_eq!(device.applied_settings().await.last(), Some(&applied));
}

#[tokio::test(start_paused = true)]
async fn test_safety_violation_hard_stops_and_restores_original() {
    let device = quiet_device(VirtualDeviceConfig {
        ambient_temp: 50.0,
        ..VirtualDeviceConfig::default()
    });
    let audit = Arc::new(MemoryAuditSink::new());
    let config = BenchmarkConfig {
        start_frequency_mhz: Some(550),
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config).with_audit(audit.clone());

    let summary = engine.run(BenchmarkMode::Optimize).await;

    assert_eq!(summary.stop_reason, StopReason::SafetyLimit);
    assert!(summary.results.is_empty());
    assert!(summary.stop_detail.unwrap().contains("safety_chip_temperature"));
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(525, 1150)));
    assert_eq!(
        device.applied_settings().await,
        vec![DeviceSettings::new(550, 1150), DeviceSettings::new(525, 1150)]
    );
    assert_eq!(audit.count(AuditKind::SafetyTrip), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_still_restores_settings() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let cancel = CancelHandle::new();
    let config = BenchmarkConfig {
        start_frequency_mhz: Some(550),
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config)
        .with_cancel(cancel.clone())
        .with_listener(Arc::new(CancelOnFirstSample(cancel)));

    let summary = engine.run(BenchmarkMode::Optimize).await;

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert!(summary.results.is_empty());
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(525, 1150)));
    assert_eq!(device.current_settings().await, DeviceSettings::new(525, 1150));
    assert_eq!(device.restart_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_reports_connection_error() {
    let device = quiet_device(VirtualDeviceConfig::default());
    device.set_offline(true).await;
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), fast_config());

    let summary = engine.run(BenchmarkMode::Optimize).await;

    assert_eq!(summary.stop_reason, StopReason::ConnectionError);
    assert!(summary.original_settings.is_none());
    assert!(summary.applied_settings.is_none());
    assert!(device.applied_settings().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overclock_stops_after_consecutive_overshoots() {
    let device = quiet_device(VirtualDeviceConfig::default());
    device.script_telemetry(vec![scripted(62.0, 1200.0)]).await;
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), fast_config());

    let summary = engine.run(BenchmarkMode::Overclock).await;

    assert_eq!(summary.stop_reason, StopReason::Completed);
    // 恰好 3 次超温后停止
    assert_eq!(summary.results.len(), 3);
    let frequencies: Vec<u32> = summary.results.iter().map(|r| r.frequency).collect();
    assert_eq!(frequencies, vec![525, 500, 475]);
    // 没有温度达标的稳定点，恢复原始设置
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(525, 1150)));
    assert_eq!(device.current_settings().await, DeviceSettings::new(525, 1150));
}

#[tokio::test(start_paused = true)]
async fn test_overclock_reverts_to_last_stable_point() {
    let device = quiet_device(VirtualDeviceConfig::default());
    // 初始读取 + 第一次测试的 7 个样本都在目标温度内，之后一直过热
    let mut script: Vec<_> = (0..8).map(|_| scripted(55.0, 1200.0)).collect();
    script.push(scripted(62.0, 1200.0));
    device.script_telemetry(script).await;
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), fast_config());

    let summary = engine.run(BenchmarkMode::Overclock).await;

    let frequencies: Vec<u32> = summary.results.iter().map(|r| r.frequency).collect();
    assert_eq!(frequencies, vec![525, 550, 525, 500]);
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(525, 1150)));
    assert_eq!(device.current_settings().await, DeviceSettings::new(525, 1150));
}

#[tokio::test(start_paused = true)]
async fn test_benchmark_pauses_and_resumes_tuner() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let control = TunerControl::new();
    let mut rx = control.subscribe();
    let engine =
        BenchmarkEngine::new("gamma", device, gamma_bounds(), fast_config()).with_control(control.clone());

    engine.run(BenchmarkMode::Quick).await;

    assert!(!control.is_paused("gamma"));
    assert_eq!(rx.try_recv().unwrap().action, ControlAction::Pause);
    assert_eq!(rx.try_recv().unwrap().action, ControlAction::Resume);
}

#[test]
fn test_multi_chip_envelope() {
    let config = BenchmarkConfig::default();
    let single = SafetyEnvelope::from_config(&config, false);
    let multi = SafetyEnvelope::from_config(&config, true);

    let mut sample = TelemetrySample::empty(Utc::now());
    sample.input_voltage = Some(12000.0);
    sample.power = Some(120.0);

    assert!(multi.check(&sample).is_ok());
    assert!(matches!(single.check(&sample), Err(SafetyError::Power { .. })));

    sample.power = Some(20.0);
    assert!(matches!(single.check(&sample), Err(SafetyError::InputVoltageHigh { .. })));

    sample.input_voltage = Some(10000.0);
    assert!(matches!(multi.check(&sample), Err(SafetyError::InputVoltageLow { .. })));
}

fn relaxed_limits(config: BenchmarkConfig) -> BenchmarkConfig {
    BenchmarkConfig {
        max_temp_c: 200.0,
        max_vr_temp_c: 200.0,
        max_power_w: 1000.0,
        ..config
    }
}

// 电压到顶后失败的频率不会再被尝试，扫描自行结束
#[tokio::test(start_paused = true)]
async fn test_overclock_at_voltage_ceiling_does_not_retry_failed_frequency() {
    let device = quiet_device(VirtualDeviceConfig {
        thermal_resistance: 0.3,
        ..VirtualDeviceConfig::default()
    });
    let config = BenchmarkConfig {
        max_voltage_mv: 1150,
        ..fast_config()
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config);

    let summary = tokio::time::timeout(Duration::from_secs(6 * 3600), engine.run(BenchmarkMode::Overclock))
        .await
        .expect("overclock sweep must terminate on its own");

    let frequencies: Vec<u32> = summary.results.iter().map(|r| r.frequency).collect();
    assert_eq!(frequencies, vec![525, 550, 575, 600, 625, 650, 675, 700, 725, 700]);
    assert!(!summary.results[8].stable);
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(700, 1150)));
    assert_eq!(device.current_settings().await, DeviceSettings::new(700, 1150));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_never_leaves_profile_bounds() {
    let device = quiet_device(VirtualDeviceConfig {
        initial_settings: DeviceSettings::new(775, 1300),
        ..VirtualDeviceConfig::default()
    });
    let bounds = gamma_bounds();
    let engine = BenchmarkEngine::new("gamma", device.clone(), bounds.clone(), relaxed_limits(fast_config()));

    let summary = engine.run(BenchmarkMode::Optimize).await;

    let frequencies: Vec<u32> = summary.results.iter().map(|r| r.frequency).collect();
    assert_eq!(frequencies, vec![775, 800]);
    assert_eq!(summary.stop_reason, StopReason::FrequencyCeiling);
    assert_eq!(summary.applied_settings, Some(DeviceSettings::new(800, 1300)));
    for applied in device.applied_settings().await {
        assert!(bounds.contains(applied), "{} outside profile", applied);
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_point_is_clamped_to_profile() {
    let device = quiet_device(VirtualDeviceConfig::default());
    let config = BenchmarkConfig {
        start_frequency_mhz: Some(1000),
        start_voltage_mv: Some(1350),
        ..relaxed_limits(fast_config())
    };
    let engine = BenchmarkEngine::new("gamma", device.clone(), gamma_bounds(), config);

    let summary = engine.run(BenchmarkMode::Optimize).await;

    assert_eq!(device.applied_settings().await[0], DeviceSettings::new(800, 1300));
    assert_eq!(summary.results[0].settings(), DeviceSettings::new(800, 1300));
    assert_eq!(summary.stop_reason, StopReason::FrequencyCeiling);
}

#[tokio::test(start_paused = true)]
async fn test_sweeps_refused_without_tuning_capability() {
    let closed = ProfileResolver::default().resolve(Some("BM1362"), None).bounds;
    let unknown = ProfileResolver::default().resolve(Some("XYZ9000"), None).bounds;

    for (bounds, mode) in [(closed.clone(), BenchmarkMode::Optimize), (unknown, BenchmarkMode::Overclock)] {
        let device = quiet_device(VirtualDeviceConfig::default());
        let engine = BenchmarkEngine::new("gamma", device.clone(), bounds, fast_config());

        let summary = engine.run(mode).await;

        assert_eq!(summary.stop_reason, StopReason::NotPermitted);
        assert!(summary.results.is_empty());
        assert!(summary.applied_settings.is_none());
        assert!(device.applied_settings().await.is_empty());
        assert_eq!(device.restart_count().await, 0);
    }

    // quick 模式只读，仍然可以运行
    let device = quiet_device(VirtualDeviceConfig::default());
    let engine = BenchmarkEngine::new("gamma", device.clone(), closed, fast_config());
    let summary = engine.run(BenchmarkMode::Quick).await;
    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.results.len(), 1);
    assert!(device.applied_settings().await.is_empty());
}

#[test]
fn test_impossible_sensor_reading_trips_envelope() {
    let envelope = SafetyEnvelope::from_config(&BenchmarkConfig::default(), false);

    let mut sample = scripted(-1.0, 1000.0);
    match envelope.check(&sample) {
        Err(SafetyError::SensorFault { sensor, value }) => {
            assert_eq!(sensor, "chip_temp");
            assert_eq!(value, -1.0);
        }
        other => panic!("unexpected result: {:?}", other),
    }

    sample.chip_temp = Some(55.0);
    sample.vr_temp = Some(f64::NAN);
    assert!(matches!(envelope.check(&sample), Err(SafetyError::SensorFault { .. })));

    // 没有 VR 传感器时上报 0
    sample.vr_temp = Some(0.0);
    assert!(envelope.check(&sample).is_ok());
}

#[test]
fn test_reported_chip_count_selects_multi_chip_envelope() {
    let config = BenchmarkConfig::default();
    let info = crate::device::DeviceInfo {
        asic_count: Some(4),
        ..Default::default()
    };
    let bounds = ProfileResolver::default()
        .resolve(Some("BM1370"), Some("Gamma"))
        .with_reported_topology(&info)
        .bounds;

    let engine = BenchmarkEngine::new("quad", quiet_device(VirtualDeviceConfig::default()), bounds, config.clone());
    assert_eq!(engine.envelope().max_power, config.max_power_multi_chip_w);
    assert_eq!(engine.envelope().min_input_voltage, config.multi_chip_min_input_voltage_mv);
}
