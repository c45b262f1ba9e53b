//! 自动优化器：在目标温度附近的历史采样中寻找能效最优的运行点

use crate::device::{DeviceSettings, TelemetrySample};
use crate::error::Rejection;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerParams {
    /// 历史长度下限 (与触发周期相同)
    pub min_history: usize,
    pub target_temp: f64,
    /// 温度带 (±°C)
    pub temp_band: f64,
    pub min_in_band_samples: usize,
    /// 算力容差 (%)
    pub tolerance_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerOutcome {
    Proposal {
        settings: DeviceSettings,
        hashrate: f64,
        reason: String,
    },
    InsufficientData(Rejection),
    NoProposal(Rejection),
}

/// 分析历史并给出建议运行点
///
/// 在温度带内找到最大算力 H，接受阈值为 H × (1 − 容差)，
/// 在达到阈值的采样中选择电压最低者；电压相同时保留最先出现的。
pub fn analyze<'a, I>(history: I, params: &OptimizerParams) -> OptimizerOutcome
where
    I: IntoIterator<Item = &'a TelemetrySample>,
{
    let samples: Vec<&TelemetrySample> = history.into_iter().collect();
    if samples.len() < params.min_history {
        return OptimizerOutcome::InsufficientData(Rejection::new(
            "history_too_short",
            format!("{} samples in history, need {}", samples.len(), params.min_history),
        ));
    }

    let in_band: Vec<(&TelemetrySample, f64)> = samples
        .iter()
        .filter(|s| {
            s.chip_temp
                .map(|t| (t - params.target_temp).abs() <= params.temp_band)
                .unwrap_or(false)
        })
        .filter_map(|s| s.hashrate.map(|h| (*s, h)))
        .collect();

    if in_band.len() < params.min_in_band_samples {
        return OptimizerOutcome::InsufficientData(Rejection::new(
            "too_few_in_band_samples",
            format!(
                "{} samples within ±{:.1}°C of {:.1}°C, need {}",
                in_band.len(),
                params.temp_band,
                params.target_temp,
                params.min_in_band_samples
            ),
        ));
    }

    let max_hashrate = in_band.iter().map(|(_, h)| *h).fold(f64::MIN, f64::max);
    let threshold = max_hashrate * (1.0 - params.tolerance_percent / 100.0);

    let mut best: Option<(&TelemetrySample, f64)> = None;
    for (sample, hashrate) in in_band.iter().filter(|(_, h)| *h >= threshold) {
        let voltage = sample.core_voltage.map(|v| v as f64).unwrap_or(f64::INFINITY);
        let better = match best {
            None => true,
            Some((current, _)) => {
                voltage < current.core_voltage.map(|v| v as f64).unwrap_or(f64::INFINITY)
            }
        };
        if better {
            best = Some((*sample, *hashrate));
        }
    }

    let Some((chosen, hashrate)) = best else {
        return OptimizerOutcome::NoProposal(Rejection::new("no_candidate", "no sample reached the acceptance threshold"));
    };

    match chosen.settings() {
        Some(settings) => OptimizerOutcome::Proposal {
            settings,
            hashrate,
            reason: format!(
                "{:.1} GH/s at {} is within {:.1}% of peak {:.1} GH/s with the lowest voltage",
                hashrate, settings, params.tolerance_percent, max_hashrate
            ),
        },
        None => OptimizerOutcome::NoProposal(Rejection::new(
            "missing_fields",
            "selected sample lacks frequency or core voltage",
        )),
    }
}
