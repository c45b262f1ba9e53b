//! 扫描汇总 → 可持久化的设备档案。纯函数，持久化由调用方负责。

use super::{BenchmarkMode, BenchmarkResult, BenchmarkSummary, StopReason};
use crate::device::DeviceSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TAG_BEST_HASHRATE: &str = "best_hashrate";
pub const TAG_BEST_EFFICIENCY: &str = "best_efficiency";
pub const TAG_STABLE: &str = "stable";
pub const TAG_UNSTABLE: &str = "unstable";
pub const TAG_APPLIED: &str = "applied";

/// 观察到的安全上限 (所有结果中的最大值)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeLimits {
    pub max_frequency: u32,
    pub max_voltage: u32,
    pub max_chip_temp: Option<f64>,
    pub max_vr_temp: Option<f64>,
    pub max_power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedResult {
    pub iteration: u32,
    pub tags: Vec<String>,
    pub result: BenchmarkResult,
}

impl TaggedResult {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// 设备基准测试档案，只整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkProfile {
    pub device_id: String,
    pub mode: BenchmarkMode,
    /// 最后一个样本的时间
    pub completed_at: Option<DateTime<Utc>>,
    pub best_hashrate: Option<BenchmarkResult>,
    pub best_efficiency: Option<BenchmarkResult>,
    pub safe_limits: Option<SafeLimits>,
    pub stop_reason: StopReason,
    pub applied_settings: Option<DeviceSettings>,
    pub results: Vec<TaggedResult>,
}

/// 最佳算力点优先取稳定结果
fn best_hashrate_index(results: &[BenchmarkResult]) -> Option<usize> {
    let pick = |stable_only: bool| {
        results
            .iter()
            .enumerate()
            .filter(|(_, r)| !stable_only || r.stable)
            .max_by(|(_, a), (_, b)| a.hashrate.total_cmp(&b.hashrate))
            .map(|(i, _)| i)
    };
    pick(true).or_else(|| pick(false))
}

fn best_efficiency_index(results: &[BenchmarkResult]) -> Option<usize> {
    results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.efficiency.map(|e| (i, e)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

fn max_option(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().reduce(f64::max)
}

fn safe_limits(results: &[BenchmarkResult]) -> Option<SafeLimits> {
    if results.is_empty() {
        return None;
    }
    Some(SafeLimits {
        max_frequency: results.iter().map(|r| r.frequency).max().unwrap_or_default(),
        max_voltage: results.iter().map(|r| r.core_voltage).max().unwrap_or_default(),
        max_chip_temp: max_option(results.iter().map(|r| r.chip_temp)),
        max_vr_temp: max_option(results.iter().map(|r| r.vr_temp)),
        max_power: max_option(results.iter().map(|r| r.power)),
    })
}

/// 由汇总生成档案
pub fn aggregate(summary: &BenchmarkSummary, device_id: &str) -> BenchmarkProfile {
    let results = &summary.results;
    let best_hashrate = best_hashrate_index(results);
    let best_efficiency = best_efficiency_index(results);

    let tagged = results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            let mut tags = vec![if result.stable { TAG_STABLE } else { TAG_UNSTABLE }.to_string()];
            if Some(index) == best_hashrate {
                tags.push(TAG_BEST_HASHRATE.to_string());
            }
            if Some(index) == best_efficiency {
                tags.push(TAG_BEST_EFFICIENCY.to_string());
            }
            if Some(result.settings()) == summary.applied_settings {
                tags.push(TAG_APPLIED.to_string());
            }
            TaggedResult {
                iteration: index as u32 + 1,
                tags,
                result: result.clone(),
            }
        })
        .collect();

    BenchmarkProfile {
        device_id: device_id.to_string(),
        mode: summary.mode,
        completed_at: results
            .iter()
            .flat_map(|r| r.samples.iter().map(|s| s.timestamp))
            .max(),
        best_hashrate: best_hashrate.map(|i| results[i].clone()),
        best_efficiency: best_efficiency.map(|i| results[i].clone()),
        safe_limits: safe_limits(results),
        stop_reason: summary.stop_reason,
        applied_settings: summary.applied_settings,
        results: tagged,
    }
}
