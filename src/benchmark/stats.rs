//! 单点测试的样本统计

use super::{BenchmarkConfig, BenchmarkResult};
use crate::device::{DeviceSettings, TelemetrySample};
use crate::error::Rejection;

/// 截尾均值：排序后两端各丢弃 `trim` 个，样本不足时退化为普通均值
pub fn trimmed_mean(values: &[f64], trim: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    if values.len() <= trim * 2 {
        return mean(values);
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    mean(&sorted[trim..sorted.len() - trim])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 丢弃预热窗口后的均值；样本不超过预热窗口时使用全部样本
pub fn mean_after_warmup(values: &[f64], warmup: usize) -> Option<f64> {
    if values.len() > warmup {
        mean(&values[warmup..])
    } else {
        mean(values)
    }
}

/// J/TH = 功率 / (算力 GH/s / 1000)
pub fn efficiency(power: Option<f64>, hashrate: f64) -> Option<f64> {
    match power {
        Some(power) if hashrate > 0.0 => Some(power / (hashrate / 1000.0)),
        _ => None,
    }
}

/// 把一次测试的原始样本处理成结果
pub fn process_samples(
    settings: DeviceSettings,
    samples: Vec<TelemetrySample>,
    expected_hashrate: f64,
    config: &BenchmarkConfig,
) -> Result<BenchmarkResult, Rejection> {
    let hashrates: Vec<f64> = samples.iter().filter_map(|s| s.hashrate).collect();
    if hashrates.len() < config.min_samples {
        return Err(Rejection::new(
            "too_few_samples",
            format!(
                "{} valid hashrate samples at {}, need {}",
                hashrates.len(),
                settings,
                config.min_samples
            ),
        ));
    }

    let hashrate = trimmed_mean(&hashrates, config.trim_count).unwrap_or(0.0);
    let chip_temps: Vec<f64> = samples.iter().filter_map(|s| s.chip_temp).collect();
    let vr_temps: Vec<f64> = samples.iter().filter_map(|s| s.vr_temp).collect();
    let powers: Vec<f64> = samples.iter().filter_map(|s| s.power).collect();

    let power = mean(&powers);
    Ok(BenchmarkResult {
        frequency: settings.frequency,
        core_voltage: settings.core_voltage,
        hashrate,
        chip_temp: mean_after_warmup(&chip_temps, config.temp_warmup_samples),
        vr_temp: mean_after_warmup(&vr_temps, config.temp_warmup_samples),
        power,
        efficiency: efficiency(power, hashrate),
        expected_hashrate,
        stable: hashrate >= expected_hashrate * config.stability_ratio,
        samples,
    })
}
