use super::optimizer::{self, OptimizerOutcome};
use super::verifier::{HashrateVerifier, VerificationVerdict};
use super::{AutoTuneSettings, PendingVerification, TelemetryHistory, TuningState};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::device::{with_timeout, DeviceClient, DeviceSettings, TelemetrySample, DEFAULT_DEVICE_TIMEOUT};
use crate::error::{DeviceError, Rejection, SafetyError};
use crate::profile::{TuningBounds, TuningCapability};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 一次 tick 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// 调优已关闭
    Disabled,
    /// 缺少必要的遥测字段
    MissingTelemetry(Vec<&'static str>),
    /// 执行了到期的校验
    Verified(VerificationVerdict),
    /// 冷却期内
    Cooldown,
    /// 安全联锁强制降到安全设置
    SafetyClamp { error: SafetyError, settings: DeviceSettings },
    /// 安全联锁触发但已处于安全设置
    SafetyHold(SafetyError),
    /// 算力卡死，已重启
    Restarted,
    /// 已下发新设置
    Adjusted {
        from: DeviceSettings,
        to: DeviceSettings,
        reason: String,
    },
    /// 有待校验的调整，探索性调整被搁置
    AwaitingVerification,
    /// 温度在滞回带内
    Paused,
    /// 升频模式达到目标，退出
    BoostCompleted,
    /// 已在边界上，无可调整
    Unchanged(String),
    /// 固件不允许下发设置
    NotPermitted(TuningCapability),
    /// 设备通信失败，本次 tick 不生效
    DeviceFailure(DeviceError),
}

/// 调整类型，决定与待校验项的关系以及能否被回滚
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    /// 安全联锁
    Safety,
    /// 降温或回滚
    Protective,
    /// 升频 / 优化
    Exploratory,
}

/// 单台设备的自动调优控制器
pub struct AutoTuner {
    device_id: String,
    client: Arc<dyn DeviceClient>,
    bounds: TuningBounds,
    settings: AutoTuneSettings,
    verifier: HashrateVerifier,
    state: TuningState,
    audit: Arc<dyn AuditSink>,
    io_timeout: Duration,
}

impl AutoTuner {
    pub fn new(
        device_id: impl Into<String>,
        client: Arc<dyn DeviceClient>,
        mut bounds: TuningBounds,
        settings: AutoTuneSettings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        if let Some(target) = settings.target_temp_c {
            bounds.target_temp = target;
        }
        if let Some(target) = settings.vr_target_temp_c {
            bounds.vr_target_temp = target;
        }
        let verifier = HashrateVerifier::new(settings.revert_drop_percent, settings.improvement_percent);
        let device_id = device_id.into();

        // 欠压阈值不随芯片数量缩放，多芯片 12V 板上实际不会触发
        if bounds.is_multi_chip() {
            warn!(
                "⚠️ {}: low input voltage threshold {:.0}mV is not scaled for {} chips",
                device_id, settings.low_input_voltage_mv, bounds.chip_count
            );
        }

        Self {
            device_id,
            client,
            bounds,
            settings,
            verifier,
            state: TuningState::new(),
            audit,
            io_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> &TuningState {
        &self.state
    }

    pub fn bounds(&self) -> &TuningBounds {
        &self.bounds
    }

    pub fn settings(&self) -> &AutoTuneSettings {
        &self.settings
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    /// 执行一次决策；第一个适用的规则结束本次 tick
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        sample: &TelemetrySample,
        history: &TelemetryHistory,
    ) -> TickOutcome {
        if !self.settings.enabled {
            return TickOutcome::Disabled;
        }

        let mut missing = Vec::new();
        if sample.hashrate.is_none() {
            missing.push("hashrate");
        }
        if sample.chip_temp.is_none() {
            missing.push("chip_temp");
        }
        if sample.frequency.is_none() {
            missing.push("frequency");
        }
        if sample.core_voltage.is_none() {
            missing.push("core_voltage");
        }
        let (Some(hashrate), Some(temp), Some(current)) = (sample.hashrate, sample.chip_temp, sample.settings()) else {
            debug!("Skipping tick for {}: missing {:?}", self.device_id, missing);
            return TickOutcome::MissingTelemetry(missing);
        };

        self.state.cycle_count += 1;
        let outcome = self.decide(now, sample, history, hashrate, temp, current).await;
        self.state.last_temp = Some(temp);
        outcome
    }

    async fn decide(
        &mut self,
        now: DateTime<Utc>,
        sample: &TelemetrySample,
        history: &TelemetryHistory,
        hashrate: f64,
        temp: f64,
        current: DeviceSettings,
    ) -> TickOutcome {
        // 1. 到期校验
        if self.state.verification_due(now) {
            return self.run_verification(now, hashrate, current).await;
        }

        // 2. 冷却
        if let Some(last) = self.state.last_adjustment_time {
            if now - last < ChronoDuration::seconds(self.settings.cooldown_secs as i64) {
                return TickOutcome::Cooldown;
            }
        }

        // 3. 安全联锁
        if let Some(error) = self.safety_violation(sample, temp) {
            return self.safety_clamp(now, error, hashrate, current).await;
        }

        // 4. 算力卡死
        if self.settings.flatline_detection && history.is_flatlined(self.settings.flatline_samples) {
            return self.restart_flatlined(now, hashrate).await;
        }

        // 5. 周期性优化
        if self.settings.optimize_every_cycles > 0
            && self.state.cycle_count % self.settings.optimize_every_cycles == 0
        {
            if let Some(outcome) = self.run_optimizer(now, history, hashrate, current).await {
                return outcome;
            }
        }

        // 6/7. 温控
        self.thermal_control(now, sample, hashrate, temp, current).await
    }

    fn safety_violation(&self, sample: &TelemetrySample, temp: f64) -> Option<SafetyError> {
        if let Some(fault) = sample.sensor_fault() {
            return Some(fault);
        }
        if let Some(input) = sample.input_voltage {
            if input < self.settings.low_input_voltage_mv {
                return Some(SafetyError::InputVoltageLow {
                    value: input,
                    limit: self.settings.low_input_voltage_mv,
                });
            }
        }
        if temp >= self.bounds.critical_temp {
            return Some(SafetyError::ChipTemperature {
                value: temp,
                limit: self.bounds.critical_temp,
            });
        }
        if let Some(vr) = sample.vr_temp {
            if vr >= self.bounds.vr_critical_temp {
                return Some(SafetyError::VrTemperature {
                    value: vr,
                    limit: self.bounds.vr_critical_temp,
                });
            }
        }
        None
    }

    async fn safety_clamp(
        &mut self,
        now: DateTime<Utc>,
        error: SafetyError,
        hashrate: f64,
        current: DeviceSettings,
    ) -> TickOutcome {
        let target = self.bounds.clamp(self.settings.safe_settings());
        self.state.frequency_boost_active = false;
        self.state.boost_baseline_hashrate = None;
        self.state.voltage_stuck_cycles = 0;
        self.state.pending_stuck_check = None;
        self.state.tuner_paused = false;

        self.audit.record(
            AuditEvent::new(&self.device_id, AuditKind::SafetyTrip, error.to_string())
                .with_code(error.code())
                .with_settings(target),
        );

        if current == target {
            return TickOutcome::SafetyHold(error);
        }

        let reason = format!("Safety interlock: {}, forcing safe defaults", error);
        match self.apply_change(now, current, target, hashrate, ChangeKind::Safety, reason).await {
            TickOutcome::Adjusted { to, .. } => TickOutcome::SafetyClamp { error, settings: to },
            other => other,
        }
    }

    async fn restart_flatlined(&mut self, now: DateTime<Utc>, hashrate: f64) -> TickOutcome {
        warn!(
            "⚠️ Hashrate flatlined at {:.2} GH/s for {} samples on {}, restarting",
            hashrate, self.settings.flatline_samples, self.device_id
        );

        let client = self.client.clone();
        if let Err(e) = with_timeout(&self.device_id, self.io_timeout, client.restart()).await {
            warn!("Restart of {} failed: {}", self.device_id, e);
            return TickOutcome::DeviceFailure(e);
        }

        self.state.reset_counters();
        self.state.restarts += 1;
        self.state.last_adjustment_time = Some(now);
        self.audit.record(
            AuditEvent::new(
                &self.device_id,
                AuditKind::Restart,
                format!(
                    "Hashrate stuck at {:.2} GH/s for {} samples",
                    hashrate, self.settings.flatline_samples
                ),
            )
            .with_code("flatline"),
        );
        TickOutcome::Restarted
    }

    async fn run_optimizer(
        &mut self,
        now: DateTime<Utc>,
        history: &TelemetryHistory,
        hashrate: f64,
        current: DeviceSettings,
    ) -> Option<TickOutcome> {
        let params = self.settings.optimizer_params(self.bounds.target_temp);
        match optimizer::analyze(history.iter(), &params) {
            OptimizerOutcome::Proposal { settings, reason, .. } => {
                let target = self.bounds.clamp(settings);
                if target == current {
                    debug!("Optimizer confirms current settings for {}", self.device_id);
                    self.audit.record(
                        AuditEvent::new(&self.device_id, AuditKind::OptimizerDecision, "Current settings already optimal")
                            .with_settings(current),
                    );
                    return None;
                }

                self.audit.record(
                    AuditEvent::new(&self.device_id, AuditKind::OptimizerDecision, reason.clone())
                        .with_settings(target),
                );
                let reason = format!("Auto-optimize: {}", reason);
                let outcome = self
                    .apply_change(now, current, target, hashrate, ChangeKind::Exploratory, reason)
                    .await;
                match outcome {
                    TickOutcome::Adjusted { .. } => {
                        self.state.frequency_boost_active = false;
                        self.state.voltage_stuck_cycles = 0;
                        self.state.pending_stuck_check = None;
                        Some(outcome)
                    }
                    TickOutcome::DeviceFailure(_) | TickOutcome::NotPermitted(_) => Some(outcome),
                    _ => None,
                }
            }
            OptimizerOutcome::InsufficientData(rejection) | OptimizerOutcome::NoProposal(rejection) => {
                self.record_rejection(&rejection);
                None
            }
        }
    }

    fn record_rejection(&self, rejection: &Rejection) {
        debug!("Optimizer skipped for {}: {}", self.device_id, rejection);
        self.audit.record(
            AuditEvent::new(&self.device_id, AuditKind::OptimizerDecision, rejection.message.clone())
                .with_code(&rejection.code),
        );
    }

    async fn thermal_control(
        &mut self,
        now: DateTime<Utc>,
        sample: &TelemetrySample,
        hashrate: f64,
        temp: f64,
        current: DeviceSettings,
    ) -> TickOutcome {
        let target = self.bounds.target_temp;
        let hysteresis = self.settings.hysteresis_c;

        // VRM 过热：频率和电压同时下调
        if let Some(vr) = sample.vr_temp {
            if vr > self.bounds.vr_target_temp {
                self.state.tuner_paused = false;
                let reason = format!(
                    "VR temperature {:.1}°C above target {:.1}°C",
                    vr, self.bounds.vr_target_temp
                );
                return self.decrease(now, current, hashrate, reason).await;
            }
        }

        let diff = temp - target;

        // 暂停状态下，温度向任一方向离开滞回带都会恢复
        if self.state.tuner_paused {
            if diff.abs() < hysteresis {
                return TickOutcome::Paused;
            }
            self.state.tuner_paused = false;
            info!(
                "▶️ {} leaves hysteresis band ({:.1}°C vs target {:.1}°C)",
                self.device_id, temp, target
            );
            self.audit.record(AuditEvent::new(
                &self.device_id,
                AuditKind::ControlChange,
                format!("Unpaused: {:.1}°C is {:.1}°C from target", temp, diff),
            ));
        }

        if diff > 0.0 {
            let reason = format!("Chip temperature {:.1}°C above target {:.1}°C", temp, target);
            return self.decrease(now, current, hashrate, reason).await;
        }

        if diff <= -hysteresis {
            return self.push(now, current, hashrate, temp).await;
        }

        if !self.state.tuner_paused {
            debug!("{} within hysteresis band at {:.1}°C, pausing", self.device_id, temp);
        }
        self.state.tuner_paused = true;
        TickOutcome::Paused
    }

    /// 对称降档：频率和电压各自独立地下调一步并夹到边界内
    async fn decrease(
        &mut self,
        now: DateTime<Utc>,
        current: DeviceSettings,
        hashrate: f64,
        reason: String,
    ) -> TickOutcome {
        let proposed = DeviceSettings::new(
            self.bounds
                .clamp_frequency(current.frequency as i64 - self.bounds.freq_step_down as i64),
            self.bounds
                .clamp_voltage(current.core_voltage as i64 - self.bounds.volt_step_down as i64),
        );

        self.state.frequency_boost_active = false;
        self.state.boost_baseline_hashrate = None;
        self.state.voltage_stuck_cycles = 0;
        self.state.pending_stuck_check = None;

        let reason = format!("{}, lowering frequency and voltage", reason);
        self.apply_change(now, current, proposed, hashrate, ChangeKind::Protective, reason)
            .await
    }

    /// 温度余量充足时提升性能
    async fn push(
        &mut self,
        now: DateTime<Utc>,
        current: DeviceSettings,
        hashrate: f64,
        temp: f64,
    ) -> TickOutcome {
        if self.state.pending_verification.is_some() {
            return TickOutcome::AwaitingVerification;
        }

        // 上一次升压的效果
        if let Some(before) = self.state.pending_stuck_check.take() {
            let improvement = super::verifier::percent_change(before, hashrate);
            if improvement < self.settings.stuck_improvement_percent {
                self.state.voltage_stuck_cycles += 1;
                debug!(
                    "{} voltage increase gained {:.2}%, stuck count {}",
                    self.device_id, improvement, self.state.voltage_stuck_cycles
                );
            } else {
                self.state.voltage_stuck_cycles = 0;
            }
        }

        let raised_frequency = self
            .bounds
            .clamp_frequency(current.frequency as i64 + self.bounds.freq_step_up as i64);

        if self.state.frequency_boost_active {
            let baseline = self.state.boost_baseline_hashrate.unwrap_or(hashrate);
            if hashrate > baseline * (1.0 + self.settings.boost_exit_percent / 100.0) {
                self.exit_boost(format!(
                    "Boost reached {:.1} GH/s over baseline {:.1} GH/s",
                    hashrate, baseline
                ));
                return TickOutcome::BoostCompleted;
            }
            if raised_frequency == current.frequency {
                self.exit_boost("Boost stopped at frequency ceiling".to_string());
                return TickOutcome::Unchanged("frequency ceiling reached during boost".to_string());
            }
            let reason = format!(
                "Frequency boost: {:.1}°C has headroom, hashrate {:.1} GH/s below boost target",
                temp, hashrate
            );
            let proposed = DeviceSettings::new(raised_frequency, current.core_voltage);
            return self
                .apply_change(now, current, proposed, hashrate, ChangeKind::Exploratory, reason)
                .await;
        }

        if self.state.voltage_stuck_cycles >= self.settings.stuck_cycles_for_boost {
            self.state.frequency_boost_active = true;
            self.state.boost_baseline_hashrate = Some(hashrate);
            self.state.voltage_stuck_cycles = 0;
            info!(
                "🚀 {} entering frequency boost from {:.1} GH/s",
                self.device_id, hashrate
            );
            let reason = format!(
                "Voltage increases stopped paying off, boosting frequency from {:.1} GH/s",
                hashrate
            );
            let proposed = DeviceSettings::new(raised_frequency, current.core_voltage);
            return self
                .apply_change(now, current, proposed, hashrate, ChangeKind::Exploratory, reason)
                .await;
        }

        let raised_voltage = if current.core_voltage < self.bounds.max_volt {
            self.bounds
                .clamp_voltage(current.core_voltage as i64 + self.bounds.volt_step_up as i64)
        } else {
            current.core_voltage
        };
        let proposed = DeviceSettings::new(raised_frequency, raised_voltage);
        let reason = format!(
            "Chip temperature {:.1}°C is {:.1}°C below target, raising performance",
            temp,
            self.bounds.target_temp - temp
        );

        let outcome = self
            .apply_change(now, current, proposed, hashrate, ChangeKind::Exploratory, reason)
            .await;
        if let TickOutcome::Adjusted { to, .. } = &outcome {
            if to.core_voltage > current.core_voltage {
                self.state.pending_stuck_check = Some(hashrate);
            } else {
                self.state.voltage_stuck_cycles = 0;
            }
        }
        outcome
    }

    fn exit_boost(&mut self, reason: String) {
        info!("🏁 {} leaving frequency boost: {}", self.device_id, reason);
        self.state.frequency_boost_active = false;
        self.state.boost_baseline_hashrate = None;
        self.state.voltage_stuck_cycles = 0;
        self.audit
            .record(AuditEvent::new(&self.device_id, AuditKind::TuningAction, reason));
    }

    async fn run_verification(
        &mut self,
        now: DateTime<Utc>,
        hashrate: f64,
        current: DeviceSettings,
    ) -> TickOutcome {
        let Some(pending) = self.state.take_verification() else {
            return TickOutcome::Unchanged("no verification pending".to_string());
        };

        let verdict = self.verifier.evaluate(&pending, hashrate);
        match &verdict {
            VerificationVerdict::Revert { to, change_percent } => {
                warn!(
                    "↩️ {} hashrate changed {:.1}% after {}, reverting to {}",
                    self.device_id, change_percent, pending.applied, to
                );
                let reason = format!(
                    "Hashrate dropped {:.1}% after change to {}, reverting",
                    -change_percent, pending.applied
                );
                let target = self.bounds.clamp(*to);
                match self
                    .apply_change(now, current, target, hashrate, ChangeKind::Protective, reason)
                    .await
                {
                    TickOutcome::DeviceFailure(e) => return TickOutcome::DeviceFailure(e),
                    TickOutcome::NotPermitted(c) => return TickOutcome::NotPermitted(c),
                    _ => {}
                }
            }
            VerificationVerdict::Improved { change_percent } => {
                info!(
                    "✅ {} hashrate improved {:.1}% with {}",
                    self.device_id, change_percent, pending.applied
                );
            }
            VerificationVerdict::Stable { change_percent } => {
                info!(
                    "➖ {} hashrate stable ({:+.1}%) with {}",
                    self.device_id, change_percent, pending.applied
                );
            }
            VerificationVerdict::ProtectiveKept { change_percent } => {
                info!(
                    "🛡️ {} keeping protective change {} despite {:.1}% hashrate change",
                    self.device_id, pending.applied, change_percent
                );
            }
        }

        self.audit.record(
            AuditEvent::new(
                &self.device_id,
                AuditKind::Verification,
                format!(
                    "Verification of {}: {:?}",
                    pending.applied, verdict
                ),
            )
            .with_settings(current),
        );
        TickOutcome::Verified(verdict)
    }

    /// 夹到边界、下发、记录之前的设置并安排校验
    async fn apply_change(
        &mut self,
        now: DateTime<Utc>,
        current: DeviceSettings,
        proposed: DeviceSettings,
        hashrate: f64,
        kind: ChangeKind,
        reason: String,
    ) -> TickOutcome {
        let target = self.bounds.clamp(proposed);
        if target == current {
            return TickOutcome::Unchanged(format!("{} already at bounds", current));
        }

        if !self.bounds.capability.can_apply() {
            debug!(
                "Not applying {} to {}: capability {}",
                target, self.device_id, self.bounds.capability
            );
            return TickOutcome::NotPermitted(self.bounds.capability);
        }

        if kind == ChangeKind::Exploratory && self.state.pending_verification.is_some() {
            return TickOutcome::AwaitingVerification;
        }

        let client = self.client.clone();
        if let Err(e) = with_timeout(&self.device_id, self.io_timeout, client.apply_settings(target)).await {
            warn!("Failed to apply {} to {}: {}", target, self.device_id, e);
            return TickOutcome::DeviceFailure(e);
        }

        self.state.schedule_verification(PendingVerification {
            scheduled_at: now,
            due_time: now + ChronoDuration::seconds(self.settings.verification_wait_secs as i64),
            hashrate_before_change: hashrate,
            previous: current,
            applied: target,
            protective: kind != ChangeKind::Exploratory,
        });
        self.state.last_adjustment_time = Some(now);
        self.state.last_hashrate = Some(hashrate);
        self.state.applied_changes += 1;

        info!("🔧 {}: {} -> {} ({})", self.device_id, current, target, reason);
        self.audit.record(
            AuditEvent::new(&self.device_id, AuditKind::TuningAction, reason.clone())
                .with_settings(target),
        );

        TickOutcome::Adjusted {
            from: current,
            to: target,
            reason,
        }
    }
}

#[cfg(test)]
mod tests;
