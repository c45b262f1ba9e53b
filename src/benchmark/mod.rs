//! 基准测试引擎
//!
//! 按需对单台设备做参数扫描，四种搜索策略共用一个单点测试原语。
//! 运行期间通过暂停/恢复通道让出该设备的自动调优。

pub mod aggregator;
pub mod engine;
pub mod stats;

use crate::device::{DeviceSettings, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use aggregator::{aggregate, BenchmarkProfile, SafeLimits, TaggedResult};
pub use engine::BenchmarkEngine;
pub use stats::{process_samples, trimmed_mean};

/// 扫描策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkMode {
    /// 当前设置下的单次测试
    Quick,
    /// 爬山搜索最高算力
    Optimize,
    /// 先 optimize，再选最低 J/TH
    Efficiency,
    /// 目标温度内的最高频率
    Overclock,
}

impl fmt::Display for BenchmarkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BenchmarkMode::Quick => "quick",
            BenchmarkMode::Optimize => "optimize",
            BenchmarkMode::Efficiency => "efficiency",
            BenchmarkMode::Overclock => "overclock",
        };
        f.write_str(name)
    }
}

/// 基准测试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub mode: BenchmarkMode,
    /// 起始电压 (mV)，为空时使用设备当前值
    pub start_voltage_mv: Option<u32>,
    /// 起始频率 (MHz)，为空时使用设备当前值
    pub start_frequency_mhz: Option<u32>,
    pub voltage_step_mv: u32,
    pub frequency_step_mhz: u32,
    /// 每个测试点的采样时长 (秒)
    pub test_duration_secs: u64,
    pub sample_interval_secs: u64,
    /// 应用设置后的稳定等待 (秒)
    pub stabilization_secs: u64,
    pub overclock_test_duration_secs: u64,
    pub overclock_stabilization_secs: u64,
    /// 超频模式的目标温度 (°C)，为空时使用设备配置的目标温度
    pub overclock_target_temp_c: Option<f64>,
    /// 硬性安全上限
    pub max_temp_c: f64,
    pub max_vr_temp_c: f64,
    pub max_power_w: f64,
    pub max_power_multi_chip_w: f64,
    /// 输入电压窗口 (mV)
    pub min_input_voltage_mv: f64,
    pub max_input_voltage_mv: f64,
    pub multi_chip_min_input_voltage_mv: f64,
    pub multi_chip_max_input_voltage_mv: f64,
    /// 扫描上限
    pub max_voltage_mv: u32,
    pub max_frequency_mhz: u32,
    /// 稳定判定：平均算力 ≥ 理论算力 × 该比例
    pub stability_ratio: f64,
    /// 截尾均值两端各丢弃的样本数
    pub trim_count: usize,
    /// 计算温度均值前丢弃的预热样本数
    pub temp_warmup_samples: usize,
    pub min_samples: usize,
    /// 超频模式连续超温的上限
    pub max_temp_exceeds: u32,
    pub progress_throttle_ms: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            mode: BenchmarkMode::Optimize,
            start_voltage_mv: None,
            start_frequency_mhz: None,
            voltage_step_mv: 20,
            frequency_step_mhz: 25,
            test_duration_secs: 600,
            sample_interval_secs: 15,
            stabilization_secs: 90,
            overclock_test_duration_secs: 120,
            overclock_stabilization_secs: 30,
            overclock_target_temp_c: None,
            max_temp_c: 66.0,
            max_vr_temp_c: 86.0,
            max_power_w: 40.0,
            max_power_multi_chip_w: 160.0,
            min_input_voltage_mv: 4800.0,
            max_input_voltage_mv: 5500.0,
            multi_chip_min_input_voltage_mv: 11000.0,
            multi_chip_max_input_voltage_mv: 13000.0,
            max_voltage_mv: 1400,
            max_frequency_mhz: 1200,
            stability_ratio: 0.94,
            trim_count: 3,
            temp_warmup_samples: 6,
            min_samples: 7,
            max_temp_exceeds: 3,
            progress_throttle_ms: 1000,
        }
    }
}

/// 单个测试点的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub frequency: u32,
    pub core_voltage: u32,
    /// 截尾均值 (GH/s)
    pub hashrate: f64,
    pub chip_temp: Option<f64>,
    pub vr_temp: Option<f64>,
    pub power: Option<f64>,
    /// J/TH，算力为零时为空
    pub efficiency: Option<f64>,
    pub expected_hashrate: f64,
    pub stable: bool,
    pub samples: Vec<TelemetrySample>,
}

impl BenchmarkResult {
    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings::new(self.frequency, self.core_voltage)
    }
}

/// 扫描结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    FrequencyCeiling,
    VoltageCeiling,
    Cancelled,
    SafetyLimit,
    ConnectionError,
    InsufficientData,
    /// 固件不允许下发设置
    NotPermitted,
}

impl StopReason {
    pub fn code(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::FrequencyCeiling => "frequency_ceiling",
            StopReason::VoltageCeiling => "voltage_ceiling",
            StopReason::Cancelled => "cancelled",
            StopReason::SafetyLimit => "safety_limit",
            StopReason::ConnectionError => "connection_error",
            StopReason::InsufficientData => "insufficient_data",
            StopReason::NotPermitted => "not_permitted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 一次完整扫描的汇总，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub device_id: String,
    pub mode: BenchmarkMode,
    /// 按测试顺序
    pub results: Vec<BenchmarkResult>,
    pub top_by_hashrate: Vec<BenchmarkResult>,
    pub top_by_efficiency: Vec<BenchmarkResult>,
    pub stop_reason: StopReason,
    /// 停止时的诊断信息
    pub stop_detail: Option<String>,
    pub original_settings: Option<DeviceSettings>,
    /// 结束时写回设备的设置
    pub applied_settings: Option<DeviceSettings>,
    /// 写回失败时的错误 (不影响扫描完成)
    pub restore_error: Option<String>,
}

const TOP_COUNT: usize = 5;

impl BenchmarkSummary {
    /// 按结果列表生成排名
    pub fn rank(results: &[BenchmarkResult]) -> (Vec<BenchmarkResult>, Vec<BenchmarkResult>) {
        let mut by_hashrate: Vec<BenchmarkResult> = results.to_vec();
        by_hashrate.sort_by(|a, b| b.hashrate.total_cmp(&a.hashrate));
        by_hashrate.truncate(TOP_COUNT);

        let mut by_efficiency: Vec<BenchmarkResult> =
            results.iter().filter(|r| r.efficiency.is_some()).cloned().collect();
        by_efficiency.sort_by(|a, b| {
            let a = a.efficiency.unwrap_or(f64::MAX);
            let b = b.efficiency.unwrap_or(f64::MAX);
            a.total_cmp(&b)
        });
        by_efficiency.truncate(TOP_COUNT);

        (by_hashrate, by_efficiency)
    }
}

/// 进度事件
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkProgress {
    pub device_id: String,
    pub iteration: u32,
    pub settings: Option<DeviceSettings>,
    pub message: String,
    /// 终止类事件不经过节流
    pub terminal: bool,
}

/// 基准测试事件回调
pub trait BenchmarkListener: Send + Sync {
    /// 节流后的进度 (默认每秒最多一次)
    fn on_progress(&self, _progress: &BenchmarkProgress) {}

    fn on_sample(&self, _device_id: &str, _sample: &TelemetrySample) {}

    fn on_iteration(&self, _device_id: &str, _iteration: u32, _result: &BenchmarkResult) {}

    fn on_finished(&self, _summary: &BenchmarkSummary) {}
}

/// 不处理任何事件
#[derive(Debug, Default, Clone)]
pub struct NoopListener;

impl BenchmarkListener for NoopListener {}

/// 协作式取消标志，在阶段之间和采样之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 进度节流器
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: Mutex::new(None),
        }
    }

    /// 是否应该发出该事件；终止事件总是放行
    pub fn should_emit(&self, terminal: bool) -> bool {
        self.should_emit_at(Instant::now(), terminal)
    }

    fn should_emit_at(&self, now: Instant, terminal: bool) -> bool {
        let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
        let due = match *last {
            Some(previous) => now.duration_since(previous) >= self.interval,
            None => true,
        };
        if due || terminal {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(hashrate: f64, efficiency: Option<f64>) -> BenchmarkResult {
        BenchmarkResult {
            frequency: 500,
            core_voltage: 1150,
            hashrate,
            chip_temp: None,
            vr_temp: None,
            power: None,
            efficiency,
            expected_hashrate: 0.0,
            stable: true,
            samples: Vec::new(),
        }
    }

    #[test]
    fn test_throttle_limits_rate_but_passes_terminal() {
        let throttle = ProgressThrottle::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(throttle.should_emit_at(start, false));
        assert!(!throttle.should_emit_at(start + Duration::from_millis(200), false));
        assert!(throttle.should_emit_at(start + Duration::from_millis(300), true));
        assert!(!throttle.should_emit_at(start + Duration::from_millis(900), false));
        assert!(throttle.should_emit_at(start + Duration::from_millis(1400), false));
    }

    #[test]
    fn test_rank_top_five() {
        let results: Vec<_> = (0..7)
            .map(|i| result(1000.0 + i as f64, if i == 3 { None } else { Some(20.0 - i as f64) }))
            .collect();
        let (by_hashrate, by_efficiency) = BenchmarkSummary::rank(&results);

        assert_eq!(by_hashrate.len(), 5);
        assert_eq!(by_hashrate[0].hashrate, 1006.0);
        assert_eq!(by_efficiency.len(), 5);
        assert_eq!(by_efficiency[0].efficiency, Some(14.0));
        assert!(by_efficiency.iter().all(|r| r.efficiency.is_some()));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(serde_json::to_string(&BenchmarkMode::Overclock).unwrap(), "\"overclock\"");
        assert_eq!(StopReason::FrequencyCeiling.to_string(), "frequency_ceiling");
    }
}
