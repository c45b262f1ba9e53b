//! 虚拟设备：进程内模拟的 AxeOS 设备，用于测试和 `--simulate` 运行

use super::{DeviceClient, DeviceInfo, DeviceSettings, TelemetrySample};
use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

/// 虚拟设备参数
#[derive(Debug, Clone)]
pub struct VirtualDeviceConfig {
    pub info: DeviceInfo,
    pub initial_settings: DeviceSettings,
    /// 环境温度 (°C)
    pub ambient_temp: f64,
    /// 每瓦升温 (°C/W)
    pub thermal_resistance: f64,
    /// 输入电压 (mV)
    pub input_voltage: f64,
    /// 算力噪声幅度 (比例)
    pub noise: f64,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            info: DeviceInfo {
                asic_model: Some("BM1370".to_string()),
                hostname: Some("virtual-gamma".to_string()),
                device_model: Some("Gamma".to_string()),
                firmware_version: Some("virtual".to_string()),
                small_core_count: Some(2040),
                asic_count: Some(1),
            },
            initial_settings: DeviceSettings::new(525, 1150),
            ambient_temp: 25.0,
            thermal_resistance: 1.6,
            input_voltage: 5000.0,
            noise: 0.01,
        }
    }
}

#[derive(Debug)]
struct VirtualState {
    settings: DeviceSettings,
    script: VecDeque<TelemetrySample>,
    applied: Vec<DeviceSettings>,
    restarts: u32,
    telemetry_reads: u32,
    failing_reads: u32,
    offline: bool,
}

/// 虚拟挖矿设备
pub struct VirtualDevice {
    device_id: String,
    config: VirtualDeviceConfig,
    state: Mutex<VirtualState>,
}

impl VirtualDevice {
    pub fn new(device_id: impl Into<String>, config: VirtualDeviceConfig) -> Self {
        let settings = config.initial_settings;
        Self {
            device_id: device_id.into(),
            config,
            state: Mutex::new(VirtualState {
                settings,
                script: VecDeque::new(),
                applied: Vec::new(),
                restarts: 0,
                telemetry_reads: 0,
                failing_reads: 0,
                offline: false,
            }),
        }
    }

    /// 预置遥测脚本：按顺序返回，最后一条会被重复返回
    pub async fn script_telemetry(&self, samples: Vec<TelemetrySample>) {
        let mut state = self.state.lock().await;
        state.script = samples.into();
    }

    /// 接下来 `count` 次遥测读取失败
    pub async fn fail_next_reads(&self, count: u32) {
        self.state.lock().await.failing_reads = count;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn current_settings(&self) -> DeviceSettings {
        self.state.lock().await.settings
    }

    pub async fn applied_settings(&self) -> Vec<DeviceSettings> {
        self.state.lock().await.applied.clone()
    }

    pub async fn restart_count(&self) -> u32 {
        self.state.lock().await.restarts
    }

    pub async fn telemetry_reads(&self) -> u32 {
        self.state.lock().await.telemetry_reads
    }

    fn connection_error(&self) -> DeviceError {
        DeviceError::Unreachable {
            device_id: self.device_id.clone(),
            error: "virtual device offline".to_string(),
        }
    }

    /// 简单的功耗/温度/算力模型
    fn simulate(&self, settings: DeviceSettings) -> TelemetrySample {
        let cores = self.config.info.small_core_count.unwrap_or(2040) as f64;
        let chips = self.config.info.asic_count.unwrap_or(1) as f64;
        let frequency = settings.frequency as f64;
        let volts = settings.core_voltage as f64 / 1000.0;

        let expected = frequency * cores * chips / 1000.0;
        // 频率越高需要的电压越高
        let required_mv = 1000.0 + (frequency - 400.0).max(0.0) * 0.5;
        let yield_ratio = if settings.core_voltage as f64 >= required_mv { 0.985 } else { 0.85 };
        let jitter = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.config.noise;

        let power = chips * volts * volts * frequency * 0.03;
        let chip_temp = self.config.ambient_temp + power / chips * self.config.thermal_resistance;
        let vr_temp = self.config.ambient_temp + power * 1.2 / chips;

        TelemetrySample {
            timestamp: Utc::now(),
            hashrate: Some(expected * yield_ratio * jitter),
            chip_temp: Some(chip_temp),
            vr_temp: Some(vr_temp),
            power: Some(power),
            input_voltage: Some(self.config.input_voltage),
            frequency: Some(settings.frequency),
            core_voltage: Some(settings.core_voltage),
        }
    }
}

#[async_trait]
impl DeviceClient for VirtualDevice {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn get_info(&self) -> Result<DeviceInfo, DeviceError> {
        if self.state.lock().await.offline {
            return Err(self.connection_error());
        }
        Ok(self.config.info.clone())
    }

    async fn get_telemetry(&self) -> Result<TelemetrySample, DeviceError> {
        let mut state = self.state.lock().await;
        state.telemetry_reads += 1;

        if state.offline {
            return Err(self.connection_error());
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(self.connection_error());
        }

        let sample = if state.script.len() > 1 {
            state.script.pop_front()
        } else {
            state.script.front().cloned()
        };

        Ok(match sample {
            Some(mut scripted) => {
                scripted.timestamp = Utc::now();
                scripted
            }
            None => self.simulate(state.settings),
        })
    }

    async fn apply_settings(&self, settings: DeviceSettings) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(self.connection_error());
        }
        debug!("Virtual device {} -> {}", self.device_id, settings);
        state.settings = settings;
        state.applied.push(settings);
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(self.connection_error());
        }
        state.restarts += 1;
        Ok(())
    }
}
