//! 自动调优
//!
//! 每台设备一个控制器，按采样周期执行一次决策链：
//! 到期校验 → 冷却 → 安全联锁 → 算力卡死 → 周期性优化 → 温控。
//! 调优状态只由所属控制器修改，从不跨设备共享。

pub mod controller;
pub mod history;
pub mod manager;
pub mod optimizer;
pub mod verifier;

use crate::device::DeviceSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{AutoTuner, TickOutcome};
pub use history::TelemetryHistory;
pub use manager::TunerManager;
pub use optimizer::{OptimizerOutcome, OptimizerParams};
pub use verifier::{HashrateVerifier, VerificationVerdict};

/// 自动调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTuneSettings {
    pub enabled: bool,
    /// 采样周期 (秒)
    pub sample_interval_secs: u64,
    /// 滚动历史窗口 (采样数)
    pub history_window: usize,
    /// 两次调整之间的最短间隔 (秒)
    pub cooldown_secs: u64,
    /// 温度滞回带 (°C)
    pub hysteresis_c: f64,
    /// 调整后等待多久校验算力 (秒)
    pub verification_wait_secs: u64,
    /// 算力下降超过该百分比则回滚
    pub revert_drop_percent: f64,
    /// 算力提升超过该百分比视为成功
    pub improvement_percent: f64,
    /// 输入电压低于该值 (mV) 时强制安全设置
    pub low_input_voltage_mv: f64,
    /// 安全默认频率 (MHz)
    pub safe_frequency_mhz: u32,
    /// 安全默认电压 (mV)
    pub safe_voltage_mv: u32,
    pub flatline_detection: bool,
    /// 连续多少个相同的非零算力视为卡死
    pub flatline_samples: usize,
    /// 每隔多少个周期运行一次优化器 (0 = 关闭)
    pub optimize_every_cycles: u64,
    /// 优化器算力容差 (%)
    pub optimizer_tolerance_percent: f64,
    /// 优化器温度带 (±°C)
    pub optimizer_temp_band_c: f64,
    /// 优化器温度带内最少采样数
    pub optimizer_min_samples: usize,
    /// 升压后算力提升低于该百分比计为一次“电压卡住”
    pub stuck_improvement_percent: f64,
    /// 电压卡住多少次后进入升频模式
    pub stuck_cycles_for_boost: u32,
    /// 升频模式下算力超过基线该百分比后退出
    pub boost_exit_percent: f64,
    /// 覆盖配置中的芯片目标温度 (°C)
    pub target_temp_c: Option<f64>,
    /// 覆盖配置中的 VR 目标温度 (°C)
    pub vr_target_temp_c: Option<f64>,
}

impl Default for AutoTuneSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 10,
            history_window: 120,
            cooldown_secs: 60,
            hysteresis_c: 2.0,
            verification_wait_secs: 90,
            revert_drop_percent: 5.0,
            improvement_percent: 1.0,
            low_input_voltage_mv: 4900.0,
            safe_frequency_mhz: 525,
            safe_voltage_mv: 1150,
            flatline_detection: true,
            flatline_samples: 30,
            optimize_every_cycles: 60,
            optimizer_tolerance_percent: 2.0,
            optimizer_temp_band_c: 2.0,
            optimizer_min_samples: 10,
            stuck_improvement_percent: 1.0,
            stuck_cycles_for_boost: 3,
            boost_exit_percent: 1.0,
            target_temp_c: None,
            vr_target_temp_c: None,
        }
    }
}

impl AutoTuneSettings {
    pub fn safe_settings(&self) -> DeviceSettings {
        DeviceSettings::new(self.safe_frequency_mhz, self.safe_voltage_mv)
    }

    pub fn optimizer_params(&self, target_temp: f64) -> OptimizerParams {
        OptimizerParams {
            min_history: self.optimize_every_cycles as usize,
            target_temp,
            temp_band: self.optimizer_temp_band_c,
            min_in_band_samples: self.optimizer_min_samples,
            tolerance_percent: self.optimizer_tolerance_percent,
        }
    }
}

/// 待执行的算力校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub scheduled_at: DateTime<Utc>,
    pub due_time: DateTime<Utc>,
    pub hashrate_before_change: f64,
    pub previous: DeviceSettings,
    pub applied: DeviceSettings,
    /// 保护性调整 (安全降档 / 降温 / 回滚) 不会被回滚
    pub protective: bool,
}

/// 单台设备的调优状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningState {
    pub cycle_count: u64,
    pub last_hashrate: Option<f64>,
    pub voltage_stuck_cycles: u32,
    pub frequency_boost_active: bool,
    /// 进入升频模式时的算力基线
    pub boost_baseline_hashrate: Option<f64>,
    /// 温度处于滞回带内而暂停
    pub tuner_paused: bool,
    pub last_adjustment_time: Option<DateTime<Utc>>,
    pub last_temp: Option<f64>,
    pub pending_verification: Option<PendingVerification>,
    /// 上一次动作为升压时的算力，等待下一次评估
    pub pending_stuck_check: Option<f64>,
    pub applied_changes: u64,
    pub verifications_scheduled: u64,
    pub verifications_cleared: u64,
    pub restarts: u64,
}

impl TuningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重启后清零计数器
    pub fn reset_counters(&mut self) {
        self.cycle_count = 0;
        self.voltage_stuck_cycles = 0;
        self.frequency_boost_active = false;
        self.boost_baseline_hashrate = None;
        self.tuner_paused = false;
        self.pending_stuck_check = None;
        self.last_hashrate = None;
        if self.pending_verification.take().is_some() {
            self.verifications_cleared += 1;
        }
    }

    pub fn schedule_verification(&mut self, pending: PendingVerification) {
        if self.pending_verification.replace(pending).is_some() {
            // 被取代的校验也算作一次清除
            self.verifications_cleared += 1;
        }
        self.verifications_scheduled += 1;
    }

    /// 取出待校验项；每个校验只会被清除一次
    pub fn take_verification(&mut self) -> Option<PendingVerification> {
        let pending = self.pending_verification.take();
        if pending.is_some() {
            self.verifications_cleared += 1;
        }
        pending
    }

    pub fn verification_due(&self, now: DateTime<Utc>) -> bool {
        self.pending_verification
            .as_ref()
            .map(|p| now >= p.due_time)
            .unwrap_or(false)
    }
}
