pub mod http;
pub mod traits;
pub mod virtual_device;

use crate::error::{DeviceError, SafetyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub use http::HttpDeviceClient;
pub use traits::DeviceClient;
pub use virtual_device::VirtualDevice;

/// 默认设备调用超时
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// 遥测采样
///
/// 固件可能省略任意字段，因此除时间戳外全部为可选。
/// 单位：算力 GH/s，温度 °C，功率 W，输入电压 mV，频率 MHz，核心电压 mV。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub hashrate: Option<f64>,
    pub chip_temp: Option<f64>,
    pub vr_temp: Option<f64>,
    pub power: Option<f64>,
    pub input_voltage: Option<f64>,
    pub frequency: Option<u32>,
    pub core_voltage: Option<u32>,
}

impl TelemetrySample {
    /// 仅带时间戳的空采样
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            hashrate: None,
            chip_temp: None,
            vr_temp: None,
            power: None,
            input_voltage: None,
            frequency: None,
            core_voltage: None,
        }
    }

    /// 当前运行设置 (频率和电压都存在时)
    pub fn settings(&self) -> Option<DeviceSettings> {
        match (self.frequency, self.core_voltage) {
            (Some(frequency), Some(core_voltage)) => Some(DeviceSettings::new(frequency, core_voltage)),
            _ => None,
        }
    }

    /// 读数明显不可能的传感器；固件在芯片测温失败时上报 -1
    pub fn sensor_fault(&self) -> Option<SafetyError> {
        if let Some(temp) = self.chip_temp.filter(|t| !t.is_finite() || *t <= 0.0) {
            return Some(SafetyError::SensorFault {
                sensor: "chip_temp".to_string(),
                value: temp,
            });
        }
        // 没有 VR 传感器的板子上报 0，只拒绝非有限值
        if let Some(vr_temp) = self.vr_temp.filter(|t| !t.is_finite()) {
            return Some(SafetyError::SensorFault {
                sensor: "vr_temp".to_string(),
                value: vr_temp,
            });
        }
        None
    }
}

/// 频率 (MHz) / 核心电压 (mV) 组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub frequency: u32,
    pub core_voltage: u32,
}

impl DeviceSettings {
    pub fn new(frequency: u32, core_voltage: u32) -> Self {
        Self { frequency, core_voltage }
    }
}

impl fmt::Display for DeviceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MHz/{}mV", self.frequency, self.core_voltage)
    }
}

/// 设备身份信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub asic_model: Option<String>,
    pub hostname: Option<String>,
    pub device_model: Option<String>,
    pub firmware_version: Option<String>,
    /// 每颗芯片的小核数量
    pub small_core_count: Option<u32>,
    pub asic_count: Option<u32>,
}

impl DeviceInfo {
    /// 用于设备覆盖配置匹配的描述字符串 (优先型号，其次主机名)
    pub fn device_descriptor(&self) -> Option<&str> {
        self.device_model
            .as_deref()
            .or(self.hostname.as_deref())
    }
}

/// 为设备调用加上超时
pub async fn with_timeout<T, F>(device_id: &str, timeout: Duration, call: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            device_id: device_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
