use super::{AutoTuneSettings, AutoTuner, TelemetryHistory, TickOutcome};
use crate::audit::AuditSink;
use crate::control::{ControlAction, TunerControl};
use crate::device::{with_timeout, DeviceClient, DeviceInfo};
use crate::error::{ErrorStats, TunerError};
use crate::profile::{ProfileResolver, ResolvedProfile};
use crate::storage::ProfileStore;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// 设备任务的描述
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub device_id: String,
    /// 配置中给出的芯片型号 (优先于设备上报)
    pub chip_model: Option<String>,
    /// 配置中给出的设备型号 (优先于设备上报)
    pub device_model: Option<String>,
}

/// 设备任务结束时的汇总
#[derive(Debug, Clone, Default)]
pub struct DeviceTaskReport {
    pub device_id: String,
    pub ticks: u64,
    pub adjustments: u64,
    pub errors: ErrorStats,
}

/// 调优任务管理器：每台设备一个独立任务
pub struct TunerManager {
    settings: AutoTuneSettings,
    resolver: ProfileResolver,
    control: TunerControl,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<dyn ProfileStore>>,
    io_timeout: Duration,
    handles: Vec<(String, JoinHandle<DeviceTaskReport>)>,
    running: Arc<RwLock<bool>>,
}

impl TunerManager {
    pub fn new(
        settings: AutoTuneSettings,
        resolver: ProfileResolver,
        control: TunerControl,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            settings,
            resolver,
            control,
            audit,
            store: None,
            io_timeout: crate::device::DEFAULT_DEVICE_TIMEOUT,
            handles: Vec::new(),
            running: Arc::new(RwLock::new(true)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn control(&self) -> &TunerControl {
        &self.control
    }

    pub fn device_count(&self) -> usize {
        self.handles.len()
    }

    /// 为设备启动调优任务
    pub fn spawn_device(&mut self, handle: DeviceHandle, client: Arc<dyn DeviceClient>) {
        let device_id = handle.device_id.clone();
        let task = DeviceTask {
            handle,
            client,
            settings: self.settings.clone(),
            resolver: self.resolver.clone(),
            control: self.control.clone(),
            audit: self.audit.clone(),
            store: self.store.clone(),
            io_timeout: self.io_timeout,
            running: self.running.clone(),
        };

        let span = info_span!("tuner", device = %device_id);
        let join = tokio::spawn(task.run().instrument(span));
        info!("🚀 Tuner started for {}", device_id);
        self.handles.push((device_id, join));
    }

    /// 停止所有任务并收集汇总
    ///
    /// 任务在下一个周期看到停止标志后退出；超过宽限期仍未退出的任务被中止。
    pub async fn stop(&mut self) -> Vec<DeviceTaskReport> {
        *self.running.write().await = false;

        let grace = Duration::from_secs(self.settings.sample_interval_secs) + self.io_timeout * 2;
        let stops = self.handles.drain(..).map(|(device_id, mut handle)| async move {
            let result = match timeout(grace, &mut handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Tuner for {} did not stop in {:?}, aborting", device_id, grace);
                    handle.abort();
                    handle.await
                }
            };

            match result {
                Ok(report) => report,
                Err(e) => {
                    if !e.is_cancelled() {
                        error!("Tuner task for {} failed: {}", device_id, e);
                    }
                    DeviceTaskReport {
                        device_id,
                        ..Default::default()
                    }
                }
            }
        });
        let reports = join_all(stops).await;

        info!("🛑 Stopped {} tuner task(s)", reports.len());
        reports
    }
}

/// 单台设备的调优任务，独占自己的控制器和历史
struct DeviceTask {
    handle: DeviceHandle,
    client: Arc<dyn DeviceClient>,
    settings: AutoTuneSettings,
    resolver: ProfileResolver,
    control: TunerControl,
    audit: Arc<dyn AuditSink>,
    store: Option<Arc<dyn ProfileStore>>,
    io_timeout: Duration,
    running: Arc<RwLock<bool>>,
}

impl DeviceTask {
    async fn run(self) -> DeviceTaskReport {
        let device_id = self.handle.device_id.clone();
        let mut report = DeviceTaskReport {
            device_id: device_id.clone(),
            ..Default::default()
        };

        let mut control_rx = self.control.subscribe();
        // 只跟踪广播信号；订阅之前的暂停由每个周期的 is_paused 覆盖
        let mut suspended = false;
        let mut ticker = interval(Duration::from_secs(self.settings.sample_interval_secs));

        // 解析设备配置，失败时在下一个周期重试
        let resolved = loop {
            ticker.tick().await;
            if !*self.running.read().await {
                return report;
            }
            match with_timeout(&device_id, self.io_timeout, self.client.get_info()).await {
                Ok(info) => break self.resolve(&info),
                Err(e) => {
                    warn!("Cannot identify {} yet: {}", device_id, e);
                    report.errors.record_error(&TunerError::from(e));
                }
            }
        };

        let mut tuner = AutoTuner::new(
            device_id.clone(),
            self.client.clone(),
            resolved.bounds,
            self.settings.clone(),
            self.audit.clone(),
        )
        .with_io_timeout(self.io_timeout);
        let mut history = self.load_history(&device_id);

        while *self.running.read().await {
            ticker.tick().await;

            suspended = drain_control(&mut control_rx, &device_id, suspended);
            // 其他进程的基准测试只留下暂停标记
            if suspended || self.control.is_paused(&device_id) {
                debug!("Tuner for {} paused by benchmark", device_id);
                continue;
            }

            let sample = match with_timeout(&device_id, self.io_timeout, self.client.get_telemetry()).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Telemetry from {} failed: {}", device_id, e);
                    report.errors.record_error(&TunerError::from(e));
                    continue;
                }
            };

            history.push(sample.clone());
            if let Some(store) = &self.store {
                if let Err(e) = store.append_history(&device_id, &sample) {
                    debug!("Failed to persist telemetry for {}: {}", device_id, e);
                    report.errors.record_error(&TunerError::from(e));
                }
            }

            report.ticks += 1;
            let outcome = tuner.tick(Utc::now(), &sample, &history).await;
            match &outcome {
                TickOutcome::Adjusted { .. } | TickOutcome::SafetyClamp { .. } => report.adjustments += 1,
                TickOutcome::DeviceFailure(e) => report.errors.record_error(&TunerError::from(e.clone())),
                _ => {}
            }
            debug!("Tick {} for {}: {:?}", report.ticks, device_id, outcome);
        }

        report
    }

    fn resolve(&self, info: &DeviceInfo) -> ResolvedProfile {
        let chip = self.handle.chip_model.as_deref().or(info.asic_model.as_deref());
        let device = self.handle.device_model.as_deref().or(info.device_descriptor());
        let resolved = self.resolver.resolve(chip, device).with_reported_topology(info);

        if let Some(warning) = &resolved.warning {
            warn!("⚠️ {}: {}", self.handle.device_id, warning);
        }
        info!(
            "📋 {} resolved to {} ({}) {}-{}MHz {}-{}mV target {:.0}°C",
            self.handle.device_id,
            resolved.chip_profile.as_deref().unwrap_or("fallback"),
            resolved.bounds.capability,
            resolved.bounds.min_freq,
            resolved.bounds.max_freq,
            resolved.bounds.min_volt,
            resolved.bounds.max_volt,
            resolved.bounds.target_temp,
        );
        resolved
    }

    /// 从存储中预加载最近一个窗口的历史
    fn load_history(&self, device_id: &str) -> TelemetryHistory {
        let capacity = self.settings.history_window;
        let Some(store) = &self.store else {
            return TelemetryHistory::new(capacity);
        };

        let to = Utc::now();
        let span = ChronoDuration::seconds((self.settings.sample_interval_secs as i64) * capacity as i64);
        match store.load_history(device_id, to - span, to) {
            Ok(samples) => TelemetryHistory::from_samples(capacity, samples),
            Err(e) => {
                warn!("Failed to load telemetry history for {}: {}", device_id, e);
                TelemetryHistory::new(capacity)
            }
        }
    }
}

/// 处理积压的暂停/恢复信号，返回最新的暂停状态
fn drain_control(
    rx: &mut broadcast::Receiver<crate::control::ControlSignal>,
    device_id: &str,
    mut suspended: bool,
) -> bool {
    loop {
        match rx.try_recv() {
            Ok(signal) if signal.device_id == device_id => {
                suspended = signal.action == ControlAction::Pause;
                info!("Tuner for {} {:?}: {}", device_id, signal.action, signal.reason);
            }
            Ok(_) => {}
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Tuner for {} missed {} control signals", device_id, skipped);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return suspended,
        }
    }
}
