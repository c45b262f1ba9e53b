use super::stats::process_samples;
use super::{
    BenchmarkConfig, BenchmarkListener, BenchmarkMode, BenchmarkProgress, BenchmarkResult, BenchmarkSummary,
    CancelHandle, NoopListener, ProgressThrottle, StopReason,
};
use crate::audit::{AuditEvent, AuditKind, AuditSink, TracingAuditSink};
use crate::control::TunerControl;
use crate::device::{with_timeout, DeviceClient, DeviceSettings, TelemetrySample, DEFAULT_DEVICE_TIMEOUT};
use crate::error::{DeviceError, Rejection, SafetyError};
use crate::profile::TuningBounds;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// 可取消等待的检查粒度
const CANCEL_POLL: Duration = Duration::from_secs(1);

/// 硬性安全包络，多芯片设备使用单独的功率和输入电压窗口
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyEnvelope {
    pub max_temp: f64,
    pub max_vr_temp: f64,
    pub max_power: f64,
    pub min_input_voltage: f64,
    pub max_input_voltage: f64,
}

impl SafetyEnvelope {
    pub fn from_config(config: &BenchmarkConfig, multi_chip: bool) -> Self {
        if multi_chip {
            Self {
                max_temp: config.max_temp_c,
                max_vr_temp: config.max_vr_temp_c,
                max_power: config.max_power_multi_chip_w,
                min_input_voltage: config.multi_chip_min_input_voltage_mv,
                max_input_voltage: config.multi_chip_max_input_voltage_mv,
            }
        } else {
            Self {
                max_temp: config.max_temp_c,
                max_vr_temp: config.max_vr_temp_c,
                max_power: config.max_power_w,
                min_input_voltage: config.min_input_voltage_mv,
                max_input_voltage: config.max_input_voltage_mv,
            }
        }
    }

    /// 缺失的字段不参与检查
    pub fn check(&self, sample: &TelemetrySample) -> Result<(), SafetyError> {
        if let Some(fault) = sample.sensor_fault() {
            return Err(fault);
        }
        if let Some(temp) = sample.chip_temp {
            if temp >= self.max_temp {
                return Err(SafetyError::ChipTemperature {
                    value: temp,
                    limit: self.max_temp,
                });
            }
        }
        if let Some(vr_temp) = sample.vr_temp {
            if vr_temp >= self.max_vr_temp {
                return Err(SafetyError::VrTemperature {
                    value: vr_temp,
                    limit: self.max_vr_temp,
                });
            }
        }
        if let Some(power) = sample.power {
            if power > self.max_power {
                return Err(SafetyError::Power {
                    value: power,
                    limit: self.max_power,
                });
            }
        }
        if let Some(voltage) = sample.input_voltage {
            if voltage < self.min_input_voltage {
                return Err(SafetyError::InputVoltageLow {
                    value: voltage,
                    limit: self.min_input_voltage,
                });
            }
            if voltage > self.max_input_voltage {
                return Err(SafetyError::InputVoltageHigh {
                    value: voltage,
                    limit: self.max_input_voltage,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct TestTiming {
    duration: Duration,
    sample_interval: Duration,
    stabilization: Duration,
}

impl TestTiming {
    fn sample_count(&self) -> usize {
        let interval = self.sample_interval.as_secs().max(1);
        ((self.duration.as_secs() / interval) as usize).max(1)
    }
}

/// 单点测试的结果
#[derive(Debug)]
enum TestOutcome {
    Completed(BenchmarkResult),
    Rejected(Rejection),
    Safety(SafetyError),
    Connection(DeviceError),
    Cancelled,
}

/// 一次扫描过程中的可变状态
struct Sweep {
    original: DeviceSettings,
    /// 设备当前实际运行的设置
    on_device: DeviceSettings,
    results: Vec<BenchmarkResult>,
    iteration: u32,
}

/// 扫描结束：原因 + 最终要写回的设置
struct SweepEnd {
    reason: StopReason,
    detail: Option<String>,
    target: Option<DeviceSettings>,
}

impl SweepEnd {
    fn new(reason: StopReason) -> Self {
        Self {
            reason,
            detail: None,
            target: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// 基准测试引擎
pub struct BenchmarkEngine {
    device_id: String,
    client: Arc<dyn DeviceClient>,
    bounds: TuningBounds,
    config: BenchmarkConfig,
    envelope: SafetyEnvelope,
    control: Option<TunerControl>,
    audit: Arc<dyn AuditSink>,
    listener: Arc<dyn BenchmarkListener>,
    cancel: CancelHandle,
    throttle: ProgressThrottle,
    io_timeout: Duration,
}

impl BenchmarkEngine {
    pub fn new(
        device_id: impl Into<String>,
        client: Arc<dyn DeviceClient>,
        bounds: TuningBounds,
        config: BenchmarkConfig,
    ) -> Self {
        let envelope = SafetyEnvelope::from_config(&config, bounds.is_multi_chip());
        let throttle = ProgressThrottle::new(Duration::from_millis(config.progress_throttle_ms));
        Self {
            device_id: device_id.into(),
            client,
            bounds,
            config,
            envelope,
            control: None,
            audit: Arc::new(TracingAuditSink),
            listener: Arc::new(NoopListener),
            cancel: CancelHandle::new(),
            throttle,
            io_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }

    /// 运行期间暂停该设备的自动调优
    pub fn with_control(mut self, control: TunerControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BenchmarkListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// 执行一次扫描。任何退出路径都会把设备恢复到已测试过的设置。
    pub async fn run(&self, mode: BenchmarkMode) -> BenchmarkSummary {
        let _pause = self
            .control
            .as_ref()
            .map(|control| control.pause_guard(&self.device_id, "benchmark started"));

        info!(
            "🏁 Starting {} benchmark on {} (multi-chip: {}, expected {:.0} GH/s per 100MHz)",
            mode,
            self.device_id,
            self.bounds.is_multi_chip(),
            self.bounds.expected_hashrate(100)
        );
        self.audit_event(AuditKind::BenchmarkTransition, format!("{} benchmark started", mode), None);
        self.progress(0, None, format!("Starting {} benchmark", mode), true);

        // 只读的 quick 模式之外都要下发设置
        if mode != BenchmarkMode::Quick && !self.bounds.capability.can_apply() {
            let end = SweepEnd::new(StopReason::NotPermitted).with_detail(format!(
                "{} firmware does not allow applying settings",
                self.bounds.capability
            ));
            return self.finish(mode, None, end).await;
        }

        let original = match self.read_settings().await {
            Ok(settings) => settings,
            Err(end) => return self.finish(mode, None, end).await,
        };

        let mut sweep = Sweep {
            original,
            on_device: original,
            results: Vec::new(),
            iteration: 0,
        };

        let end = match mode {
            BenchmarkMode::Quick => self.run_quick(&mut sweep).await,
            BenchmarkMode::Optimize => {
                let mut end = self.run_optimize(&mut sweep).await;
                end.target = best_stable_by_hashrate(&sweep.results);
                end
            }
            BenchmarkMode::Efficiency => {
                let mut end = self.run_optimize(&mut sweep).await;
                end.target = best_by_efficiency(&sweep.results);
                end
            }
            BenchmarkMode::Overclock => self.run_overclock(&mut sweep).await,
        };

        self.finish(mode, Some(&mut sweep), end).await
    }

    /// 读取当前设置作为原始设置
    async fn read_settings(&self) -> Result<DeviceSettings, SweepEnd> {
        let sample = with_timeout(&self.device_id, self.io_timeout, self.client.get_telemetry())
            .await
            .map_err(|e| SweepEnd::new(StopReason::ConnectionError).with_detail(e.to_string()))?;

        sample.settings().ok_or_else(|| {
            SweepEnd::new(StopReason::InsufficientData)
                .with_detail(Rejection::new("missing_settings", "telemetry lacks frequency/core voltage").to_string())
        })
    }

    async fn run_quick(&self, sweep: &mut Sweep) -> SweepEnd {
        let settings = sweep.on_device;
        match self.run_test(sweep, settings, false, self.standard_timing()).await {
            TestOutcome::Completed(result) => {
                self.record(sweep, result);
                SweepEnd::new(StopReason::Completed)
            }
            other => self.stop_for(other),
        }
    }

    /// 爬山：稳定则升频，不稳定则降频并加压
    async fn run_optimize(&self, sweep: &mut Sweep) -> SweepEnd {
        let freq_step = self.config.frequency_step_mhz;
        let volt_step = self.config.voltage_step_mv;
        let mut settings = self.start_settings(sweep.original);

        loop {
            let result = match self.run_test(sweep, settings, true, self.standard_timing()).await {
                TestOutcome::Completed(result) => result,
                other => return self.stop_for(other),
            };
            let stable = result.stable;
            self.record(sweep, result);

            if stable {
                let next = settings.frequency + freq_step;
                if next > self.max_frequency() {
                    return SweepEnd::new(StopReason::FrequencyCeiling);
                }
                settings.frequency = next;
            } else {
                let next = settings.core_voltage + volt_step;
                if next > self.max_voltage() {
                    return SweepEnd::new(StopReason::VoltageCeiling);
                }
                settings.frequency = settings.frequency.saturating_sub(freq_step).max(self.bounds.min_freq);
                settings.core_voltage = next;
            }
        }
    }

    /// 目标温度内的最高频率
    async fn run_overclock(&self, sweep: &mut Sweep) -> SweepEnd {
        let freq_step = self.config.frequency_step_mhz;
        let volt_step = self.config.voltage_step_mv;
        let target_temp = self.overclock_target_temp();
        let timing = self.overclock_timing();

        let mut settings = self.start_settings(sweep.original);
        let mut last_stable: Option<DeviceSettings> = None;
        let mut exceeds = 0u32;
        // 超温过的频率不再尝试
        let mut freq_cap = self.max_frequency();

        let mut end = loop {
            let result = match self.run_test(sweep, settings, true, timing).await {
                TestOutcome::Completed(result) => result,
                other => break self.stop_for(other),
            };
            let over_target = result.chip_temp.map_or(false, |t| t > target_temp);
            let stable = result.stable;
            self.record(sweep, result);

            if over_target {
                exceeds += 1;
                warn!(
                    "🌡️ {} over target {:.1}°C at {} ({}/{})",
                    self.device_id, target_temp, settings, exceeds, self.config.max_temp_exceeds
                );
                if exceeds >= self.config.max_temp_exceeds {
                    let mut end = SweepEnd::new(StopReason::Completed)
                        .with_detail(format!("{} consecutive results above {:.1}°C", exceeds, target_temp));
                    end.target = last_stable;
                    break end;
                }
                freq_cap = freq_cap.min(settings.frequency.saturating_sub(freq_step));
                settings.frequency = settings.frequency.saturating_sub(freq_step).max(self.bounds.min_freq);
                continue;
            }
            exceeds = 0;

            if !stable {
                if settings.core_voltage + volt_step <= self.max_voltage() {
                    settings.core_voltage += volt_step;
                } else if settings.frequency > self.bounds.min_freq {
                    // 电压已到顶时失败的频率同样不再尝试
                    freq_cap = freq_cap.min(settings.frequency.saturating_sub(freq_step));
                    settings.frequency = settings.frequency.saturating_sub(freq_step).max(self.bounds.min_freq);
                } else {
                    break SweepEnd::new(StopReason::VoltageCeiling);
                }
                continue;
            }

            last_stable = Some(settings);
            let next = settings.frequency + freq_step;
            if next > freq_cap {
                let reason = if freq_cap < self.max_frequency() {
                    StopReason::Completed
                } else {
                    StopReason::FrequencyCeiling
                };
                break SweepEnd::new(reason);
            }
            settings.frequency = next;
        };

        if end.target.is_none() {
            end.target = sweep
                .results
                .iter()
                .filter(|r| r.stable && r.chip_temp.map_or(true, |t| t <= target_temp))
                .max_by(|a, b| a.hashrate.total_cmp(&b.hashrate))
                .map(BenchmarkResult::settings);
        }
        end
    }

    /// 单点测试：可选应用设置并等待稳定，然后按固定间隔采样
    async fn run_test(
        &self,
        sweep: &mut Sweep,
        settings: DeviceSettings,
        apply: bool,
        timing: TestTiming,
    ) -> TestOutcome {
        if self.cancel.is_cancelled() {
            return TestOutcome::Cancelled;
        }
        let iteration = sweep.iteration + 1;

        if apply {
            self.progress(iteration, Some(settings), format!("Applying {}", settings), false);
            if let Err(e) = with_timeout(&self.device_id, self.io_timeout, self.client.apply_settings(settings)).await {
                return TestOutcome::Connection(e);
            }
            sweep.on_device = settings;
            if let Err(e) = with_timeout(&self.device_id, self.io_timeout, self.client.restart()).await {
                return TestOutcome::Connection(e);
            }
            debug!("Waiting {:?} for {} to stabilize", timing.stabilization, self.device_id);
            if !self.sleep_cancellable(timing.stabilization).await {
                return TestOutcome::Cancelled;
            }
        }

        let expected = self.bounds.expected_hashrate(settings.frequency);
        let count = timing.sample_count();
        let mut samples = Vec::with_capacity(count);

        for index in 0..count {
            if self.cancel.is_cancelled() {
                return TestOutcome::Cancelled;
            }
            let sample = match with_timeout(&self.device_id, self.io_timeout, self.client.get_telemetry()).await {
                Ok(sample) => sample,
                Err(e) => return TestOutcome::Connection(e),
            };
            if let Err(e) = self.envelope.check(&sample) {
                self.audit_event(
                    AuditKind::SafetyTrip,
                    format!("benchmark stopped at {}: {}", settings, e),
                    Some(settings),
                );
                return TestOutcome::Safety(e);
            }

            self.listener.on_sample(&self.device_id, &sample);
            samples.push(sample);
            self.progress(
                iteration,
                Some(settings),
                format!("Sample {}/{} at {}", index + 1, count, settings),
                false,
            );

            if index + 1 < count && !self.sleep_cancellable(timing.sample_interval).await {
                return TestOutcome::Cancelled;
            }
        }

        match process_samples(settings, samples, expected, &self.config) {
            Ok(result) => TestOutcome::Completed(result),
            Err(rejection) => TestOutcome::Rejected(rejection),
        }
    }

    fn record(&self, sweep: &mut Sweep, result: BenchmarkResult) {
        sweep.iteration += 1;
        info!(
            "📊 {} #{} {}: {:.1} GH/s (expected {:.1}) {} {}",
            self.device_id,
            sweep.iteration,
            result.settings(),
            result.hashrate,
            result.expected_hashrate,
            result.efficiency.map(|e| format!("{:.2} J/TH", e)).unwrap_or_default(),
            if result.stable { "stable" } else { "unstable" }
        );
        self.listener.on_iteration(&self.device_id, sweep.iteration, &result);
        self.progress(
            sweep.iteration,
            Some(result.settings()),
            format!("Iteration {} complete", sweep.iteration),
            true,
        );
        sweep.results.push(result);
    }

    fn stop_for(&self, outcome: TestOutcome) -> SweepEnd {
        match outcome {
            TestOutcome::Completed(_) => SweepEnd::new(StopReason::Completed),
            TestOutcome::Rejected(rejection) => {
                warn!("{} benchmark test rejected: {}", self.device_id, rejection);
                SweepEnd::new(StopReason::InsufficientData).with_detail(rejection.to_string())
            }
            TestOutcome::Safety(e) => {
                warn!("🛑 {} benchmark hard stop: {}", self.device_id, e);
                SweepEnd::new(StopReason::SafetyLimit).with_detail(format!("[{}] {}", e.code(), e))
            }
            TestOutcome::Connection(e) => {
                warn!("🔌 {} benchmark connection failure: {}", self.device_id, e);
                SweepEnd::new(StopReason::ConnectionError).with_detail(format!("[{}] {}", e.code(), e))
            }
            TestOutcome::Cancelled => {
                info!("{} benchmark cancelled", self.device_id);
                SweepEnd::new(StopReason::Cancelled)
            }
        }
    }

    /// 强制的收尾：写回最佳设置或原始设置，然后生成汇总
    async fn finish(
        &self,
        mode: BenchmarkMode,
        sweep: Option<&mut Sweep>,
        end: SweepEnd,
    ) -> BenchmarkSummary {
        let (results, original, applied, restore_error) = match sweep {
            Some(sweep) => {
                let target = end.target.unwrap_or(sweep.original);
                let (applied, restore_error) = self.restore(sweep, target).await;
                (std::mem::take(&mut sweep.results), Some(sweep.original), applied, restore_error)
            }
            None => (Vec::new(), None, None, None),
        };

        let (top_by_hashrate, top_by_efficiency) = BenchmarkSummary::rank(&results);
        let summary = BenchmarkSummary {
            device_id: self.device_id.clone(),
            mode,
            results,
            top_by_hashrate,
            top_by_efficiency,
            stop_reason: end.reason,
            stop_detail: end.detail,
            original_settings: original,
            applied_settings: applied,
            restore_error,
        };

        info!(
            "🏁 {} benchmark on {} finished: {} ({} results), device at {}",
            mode,
            self.device_id,
            summary.stop_reason,
            summary.results.len(),
            applied.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
        self.audit_event(
            AuditKind::BenchmarkTransition,
            format!("{} benchmark finished: {}", mode, summary.stop_reason),
            applied,
        );
        self.progress(
            summary.results.len() as u32,
            applied,
            format!("Finished: {}", summary.stop_reason),
            true,
        );
        self.listener.on_finished(&summary);
        summary
    }

    /// 写回失败只报告，不阻止扫描完成
    async fn restore(&self, sweep: &mut Sweep, target: DeviceSettings) -> (Option<DeviceSettings>, Option<String>) {
        if sweep.on_device == target {
            return (Some(target), None);
        }

        info!("↩️ Restoring {} to {}", self.device_id, target);
        let restored = async {
            with_timeout(&self.device_id, self.io_timeout, self.client.apply_settings(target)).await?;
            with_timeout(&self.device_id, self.io_timeout, self.client.restart()).await
        }
        .await;

        match restored {
            Ok(()) => {
                sweep.on_device = target;
                (Some(target), None)
            }
            Err(e) => {
                warn!("Failed to restore {} to {}: {}", self.device_id, target, e);
                (None, Some(format!("[{}] {}", e.code(), e)))
            }
        }
    }

    /// 扫描上限：配置上限和设备配置边界取较小者
    fn max_frequency(&self) -> u32 {
        self.config.max_frequency_mhz.min(self.bounds.max_freq)
    }

    fn max_voltage(&self) -> u32 {
        self.config.max_voltage_mv.min(self.bounds.max_volt)
    }

    /// 起点总是落在设备边界和扫描上限之内
    fn start_settings(&self, original: DeviceSettings) -> DeviceSettings {
        let start = self.bounds.clamp(DeviceSettings::new(
            self.config.start_frequency_mhz.unwrap_or(original.frequency),
            self.config.start_voltage_mv.unwrap_or(original.core_voltage),
        ));
        DeviceSettings::new(
            start.frequency.min(self.max_frequency()),
            start.core_voltage.min(self.max_voltage()),
        )
    }

    fn overclock_target_temp(&self) -> f64 {
        self.config.overclock_target_temp_c.unwrap_or(self.bounds.target_temp)
    }

    fn standard_timing(&self) -> TestTiming {
        TestTiming {
            duration: Duration::from_secs(self.config.test_duration_secs),
            sample_interval: Duration::from_secs(self.config.sample_interval_secs),
            stabilization: Duration::from_secs(self.config.stabilization_secs),
        }
    }

    fn overclock_timing(&self) -> TestTiming {
        TestTiming {
            duration: Duration::from_secs(self.config.overclock_test_duration_secs),
            sample_interval: Duration::from_secs(self.config.sample_interval_secs),
            stabilization: Duration::from_secs(self.config.overclock_stabilization_secs),
        }
    }

    /// 分段等待以便及时响应取消；被取消时返回 false
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep((deadline - now).min(CANCEL_POLL)).await;
        }
    }

    fn progress(&self, iteration: u32, settings: Option<DeviceSettings>, message: String, terminal: bool) {
        if self.throttle.should_emit(terminal) {
            self.listener.on_progress(&BenchmarkProgress {
                device_id: self.device_id.clone(),
                iteration,
                settings,
                message,
                terminal,
            });
        }
    }

    fn audit_event(&self, kind: AuditKind, reason: String, settings: Option<DeviceSettings>) {
        let mut event = AuditEvent::new(&self.device_id, kind, reason);
        if let Some(settings) = settings {
            event = event.with_settings(settings);
        }
        self.audit.record(event);
    }
}

/// 稳定结果中算力最高者
fn best_stable_by_hashrate(results: &[BenchmarkResult]) -> Option<DeviceSettings> {
    results
        .iter()
        .filter(|r| r.stable)
        .max_by(|a, b| a.hashrate.total_cmp(&b.hashrate))
        .map(BenchmarkResult::settings)
}

/// 全部结果中 J/TH 最低者
fn best_by_efficiency(results: &[BenchmarkResult]) -> Option<DeviceSettings> {
    results
        .iter()
        .filter_map(|r| r.efficiency.map(|e| (e, r)))
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, r)| r.settings())
}

#[cfg(test)]
mod tests;
