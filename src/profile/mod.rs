//! 设备配置解析
//!
//! 将芯片型号和设备描述映射为安全边界、步进大小、目标温度和调优能力。
//! 芯片表和设备覆盖表都是有序的 (谓词, 参数) 列表，首个匹配生效；
//! 设备覆盖中存在的字段遮蔽芯片默认值。纯函数，无 I/O。

mod tables;

use crate::device::{DeviceInfo, DeviceSettings};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub use tables::{builtin_chip_profiles, builtin_device_overrides};

/// 固件调优能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningCapability {
    /// 完整的频率/电压控制
    Full,
    /// 部分控制
    Limited,
    /// 固件不开放控制
    Closed,
    /// 未识别
    Unknown,
}

impl TuningCapability {
    /// closed / unknown 时控制器绝不能下发设置
    pub fn can_apply(&self) -> bool {
        matches!(self, TuningCapability::Full | TuningCapability::Limited)
    }
}

impl fmt::Display for TuningCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TuningCapability::Full => "full",
            TuningCapability::Limited => "limited",
            TuningCapability::Closed => "closed",
            TuningCapability::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 调优边界
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningBounds {
    /// 频率范围 (MHz)
    pub min_freq: u32,
    pub max_freq: u32,
    /// 核心电压范围 (mV)
    pub min_volt: u32,
    pub max_volt: u32,
    /// 芯片目标温度 (°C)
    pub target_temp: f64,
    /// VR 目标温度 (°C)
    pub vr_target_temp: f64,
    /// 触发紧急降档的芯片温度 (°C)
    pub critical_temp: f64,
    /// 触发紧急降档的 VR 温度 (°C)
    pub vr_critical_temp: f64,
    pub freq_step_up: u32,
    pub freq_step_down: u32,
    pub volt_step_up: u32,
    pub volt_step_down: u32,
    /// 每颗芯片的小核数量
    pub cores_per_chip: u32,
    pub chip_count: u32,
    pub capability: TuningCapability,
}

impl TuningBounds {
    /// 未识别芯片使用的保守边界
    pub fn conservative() -> Self {
        Self {
            min_freq: 400,
            max_freq: 500,
            min_volt: 1100,
            max_volt: 1200,
            target_temp: 55.0,
            vr_target_temp: 65.0,
            critical_temp: 65.0,
            vr_critical_temp: 80.0,
            freq_step_up: 12,
            freq_step_down: 12,
            volt_step_up: 5,
            volt_step_down: 5,
            cores_per_chip: 0,
            chip_count: 1,
            capability: TuningCapability::Unknown,
        }
    }

    pub fn clamp_frequency(&self, frequency: i64) -> u32 {
        frequency.clamp(self.min_freq as i64, self.max_freq as i64) as u32
    }

    pub fn clamp_voltage(&self, voltage: i64) -> u32 {
        voltage.clamp(self.min_volt as i64, self.max_volt as i64) as u32
    }

    pub fn clamp(&self, settings: DeviceSettings) -> DeviceSettings {
        DeviceSettings::new(
            self.clamp_frequency(settings.frequency as i64),
            self.clamp_voltage(settings.core_voltage as i64),
        )
    }

    pub fn contains(&self, settings: DeviceSettings) -> bool {
        (self.min_freq..=self.max_freq).contains(&settings.frequency)
            && (self.min_volt..=self.max_volt).contains(&settings.core_voltage)
    }

    pub fn is_multi_chip(&self) -> bool {
        self.chip_count > 1
    }

    /// 理论算力 (GH/s) = 频率 × 小核数 × 芯片数 / 1000
    pub fn expected_hashrate(&self, frequency: u32) -> f64 {
        frequency as f64 * (self.cores_per_chip as f64 * self.chip_count as f64 / 1000.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_freq > self.max_freq {
            return Err(ConfigError::InvertedBounds {
                field: "frequency".to_string(),
                min: self.min_freq as f64,
                max: self.max_freq as f64,
            });
        }
        if self.min_volt > self.max_volt {
            return Err(ConfigError::InvertedBounds {
                field: "core_voltage".to_string(),
                min: self.min_volt as f64,
                max: self.max_volt as f64,
            });
        }
        if self.target_temp > self.critical_temp {
            return Err(ConfigError::InvertedBounds {
                field: "chip_temperature".to_string(),
                min: self.target_temp,
                max: self.critical_temp,
            });
        }
        if self.vr_target_temp > self.vr_critical_temp {
            return Err(ConfigError::InvertedBounds {
                field: "vr_temperature".to_string(),
                min: self.vr_target_temp,
                max: self.vr_critical_temp,
            });
        }
        let steps = [
            ("freq_step_up", self.freq_step_up),
            ("freq_step_down", self.freq_step_down),
            ("volt_step_up", self.volt_step_up),
            ("volt_step_down", self.volt_step_down),
        ];
        for (field, step) in steps {
            if step == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "step must be greater than 0".to_string(),
                });
            }
        }
        if self.chip_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chip_count".to_string(),
                value: "0".to_string(),
                reason: "chip count must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// 设备覆盖：存在的字段遮蔽芯片默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundsOverride {
    pub min_freq: Option<u32>,
    pub max_freq: Option<u32>,
    pub min_volt: Option<u32>,
    pub max_volt: Option<u32>,
    pub target_temp: Option<f64>,
    pub vr_target_temp: Option<f64>,
    pub critical_temp: Option<f64>,
    pub vr_critical_temp: Option<f64>,
    pub freq_step_up: Option<u32>,
    pub freq_step_down: Option<u32>,
    pub volt_step_up: Option<u32>,
    pub volt_step_down: Option<u32>,
    pub cores_per_chip: Option<u32>,
    pub chip_count: Option<u32>,
    pub capability: Option<TuningCapability>,
}

impl BoundsOverride {
    pub fn apply_to(&self, base: &TuningBounds) -> TuningBounds {
        TuningBounds {
            min_freq: self.min_freq.unwrap_or(base.min_freq),
            max_freq: self.max_freq.unwrap_or(base.max_freq),
            min_volt: self.min_volt.unwrap_or(base.min_volt),
            max_volt: self.max_volt.unwrap_or(base.max_volt),
            target_temp: self.target_temp.unwrap_or(base.target_temp),
            vr_target_temp: self.vr_target_temp.unwrap_or(base.vr_target_temp),
            critical_temp: self.critical_temp.unwrap_or(base.critical_temp),
            vr_critical_temp: self.vr_critical_temp.unwrap_or(base.vr_critical_temp),
            freq_step_up: self.freq_step_up.unwrap_or(base.freq_step_up),
            freq_step_down: self.freq_step_down.unwrap_or(base.freq_step_down),
            volt_step_up: self.volt_step_up.unwrap_or(base.volt_step_up),
            volt_step_down: self.volt_step_down.unwrap_or(base.volt_step_down),
            cores_per_chip: self.cores_per_chip.unwrap_or(base.cores_per_chip),
            chip_count: self.chip_count.unwrap_or(base.chip_count),
            capability: self.capability.unwrap_or(base.capability),
        }
    }
}

/// 输入在匹配前统一转为小写
pub type Matcher = fn(&str) -> bool;

/// 芯片默认配置
#[derive(Clone)]
pub struct ChipProfile {
    pub name: &'static str,
    pub matches: Matcher,
    pub bounds: TuningBounds,
}

/// 多芯片设备覆盖
#[derive(Clone)]
pub struct DeviceOverride {
    pub name: &'static str,
    pub matches: Matcher,
    pub overrides: BoundsOverride,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub bounds: TuningBounds,
    pub chip_profile: Option<String>,
    pub device_override: Option<String>,
    pub warning: Option<String>,
}

impl ResolvedProfile {
    pub fn capability(&self) -> TuningCapability {
        self.bounds.capability
    }

    /// 设备上报的芯片数和小核数遮蔽表中的拓扑；缺失或为 0 时保留表中的值
    pub fn with_reported_topology(mut self, info: &DeviceInfo) -> Self {
        if let Some(count) = info.asic_count.filter(|&n| n > 0) {
            if count != self.bounds.chip_count {
                debug!("Device reports {} chip(s), profile had {}", count, self.bounds.chip_count);
            }
            self.bounds.chip_count = count;
        }
        if let Some(cores) = info.small_core_count.filter(|&n| n > 0) {
            if cores != self.bounds.cores_per_chip {
                debug!(
                    "Device reports {} small cores per chip, profile had {}",
                    cores, self.bounds.cores_per_chip
                );
            }
            self.bounds.cores_per_chip = cores;
        }
        self
    }
}

/// 设备配置解析器
#[derive(Clone)]
pub struct ProfileResolver {
    chips: Vec<ChipProfile>,
    devices: Vec<DeviceOverride>,
}

impl Default for ProfileResolver {
    fn default() -> Self {
        Self::new(builtin_chip_profiles(), builtin_device_overrides())
    }
}

impl ProfileResolver {
    pub fn new(chips: Vec<ChipProfile>, devices: Vec<DeviceOverride>) -> Self {
        Self { chips, devices }
    }

    pub fn resolve(&self, chip_model: Option<&str>, device: Option<&str>) -> ResolvedProfile {
        let chip_key = chip_model.map(normalize);
        let device_key = device.map(normalize);

        let chip = chip_key
            .as_deref()
            .and_then(|key| self.chips.iter().find(|profile| (profile.matches)(key)));
        let device_override = device_key
            .as_deref()
            .and_then(|key| self.devices.iter().find(|entry| (entry.matches)(key)));

        let base = chip
            .map(|profile| profile.bounds.clone())
            .unwrap_or_else(TuningBounds::conservative);
        let merged = match device_override {
            Some(entry) => entry.overrides.apply_to(&base),
            None => base,
        };

        if let Err(e) = merged.validate() {
            return ResolvedProfile {
                bounds: TuningBounds::conservative(),
                chip_profile: None,
                device_override: None,
                warning: Some(format!(
                    "Rejected profile ({}): {}; using conservative bounds, tuning disabled",
                    e.code(),
                    e
                )),
            };
        }

        let warning = match merged.capability {
            TuningCapability::Full => None,
            TuningCapability::Limited => Some(format!(
                "Limited tuning support for {}: firmware exposes partial control",
                chip_model.unwrap_or("unknown chip")
            )),
            TuningCapability::Closed => Some(format!(
                "Closed firmware on {}: settings will never be applied",
                device.or(chip_model).unwrap_or("unknown device")
            )),
            TuningCapability::Unknown => Some(format!(
                "Unrecognised chip {:?}: conservative bounds, settings will never be applied",
                chip_model.unwrap_or("")
            )),
        };

        ResolvedProfile {
            bounds: merged,
            chip_profile: chip.map(|profile| profile.name.to_string()),
            device_override: device_override.map(|entry| entry.name.to_string()),
            warning,
        }
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
