//! AxeOS 风格 HTTP 设备客户端

use super::{DeviceClient, DeviceInfo, DeviceSettings, TelemetrySample, DEFAULT_DEVICE_TIMEOUT};
use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// 信息接口，按顺序尝试
/// 只暴露 swarm 接口的旧固件返回同样的字段
const INFO_PATHS: [&str; 3] = ["/api/system/info", "/api/system", "/api/swarm/info"];
const SETTINGS_PATH: &str = "/api/system";
const RESTART_PATH: &str = "/api/system/restart";

#[derive(Debug, Serialize)]
struct SettingsUpdate {
    frequency: u32,
    #[serde(rename = "coreVoltage")]
    core_voltage: u32,
}

/// HTTP 设备客户端
pub struct HttpDeviceClient {
    device_id: String,
    base_url: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeviceClient {
    /// 创建客户端；`address` 可以是裸 IP/主机名或完整 URL
    pub fn new(device_id: impl Into<String>, address: &str) -> Result<Self, DeviceError> {
        Self::with_timeout(device_id, address, DEFAULT_DEVICE_TIMEOUT)
    }

    pub fn with_timeout(
        device_id: impl Into<String>,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let device_id = device_id.into();
        let base_url = parse_address(address)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Unreachable {
                device_id: device_id.clone(),
                error: e.to_string(),
            })?;

        Ok(Self {
            device_id,
            base_url,
            client,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeviceError> {
        self.base_url.join(path).map_err(|_| DeviceError::InvalidAddress {
            address: format!("{}{}", self.base_url, path),
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> DeviceError {
        if error.is_timeout() {
            DeviceError::Timeout {
                device_id: self.device_id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if error.is_decode() {
            DeviceError::Malformed {
                device_id: self.device_id.clone(),
                error: error.to_string(),
            }
        } else {
            DeviceError::Unreachable {
                device_id: self.device_id.clone(),
                error: error.to_string(),
            }
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, DeviceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(DeviceError::Http {
            device_id: self.device_id.clone(),
            status_code: status.as_u16(),
            message,
        })
    }

    /// 读取系统信息 JSON，依次尝试已知路径
    async fn fetch_system_info(&self) -> Result<Value, DeviceError> {
        let mut last_error = None;

        for path in INFO_PATHS {
            let url = self.endpoint(path)?;
            let attempt = async {
                let response = self.client.get(url).send().await.map_err(|e| self.transport_error(e))?;
                let response = self.check_status(response).await?;
                response.json::<Value>().await.map_err(|e| DeviceError::Malformed {
                    device_id: self.device_id.clone(),
                    error: e.to_string(),
                })
            };

            match attempt.await {
                Ok(json) => return Ok(json),
                Err(e) => {
                    debug!("System info via {} failed for {}: {}", path, self.device_id, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DeviceError::Unreachable {
            device_id: self.device_id.clone(),
            error: "no info endpoint responded".to_string(),
        }))
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn get_info(&self) -> Result<DeviceInfo, DeviceError> {
        let json = self.fetch_system_info().await?;
        Ok(parse_info(&json))
    }

    async fn get_telemetry(&self) -> Result<TelemetrySample, DeviceError> {
        let json = self.fetch_system_info().await?;
        Ok(parse_telemetry(&json))
    }

    async fn apply_settings(&self, settings: DeviceSettings) -> Result<(), DeviceError> {
        let url = self.endpoint(SETTINGS_PATH)?;
        let body = SettingsUpdate {
            frequency: settings.frequency,
            core_voltage: settings.core_voltage,
        };

        let response = self
            .client
            .patch(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await?;

        debug!("Applied {} to {}", settings, self.device_id);
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        let url = self.endpoint(RESTART_PATH)?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response).await?;
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<Url, DeviceError> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    Url::parse(&candidate).map_err(|_| DeviceError::InvalidAddress {
        address: address.to_string(),
    })
}

fn number(json: &Value, key: &str) -> Option<f64> {
    json.get(key).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn text(json: &Value, key: &str) -> Option<String> {
    json.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// 解析遥测字段；`vrTemp` 为 0 表示该板没有 VR 传感器
pub(crate) fn parse_telemetry(json: &Value) -> TelemetrySample {
    TelemetrySample {
        timestamp: Utc::now(),
        hashrate: number(json, "hashRate"),
        chip_temp: number(json, "temp"),
        vr_temp: number(json, "vrTemp").filter(|t| *t > 0.0),
        power: number(json, "power"),
        input_voltage: number(json, "voltage"),
        frequency: number(json, "frequency").map(|f| f.round() as u32),
        core_voltage: number(json, "coreVoltage").map(|v| v.round() as u32),
    }
}

pub(crate) fn parse_info(json: &Value) -> DeviceInfo {
    DeviceInfo {
        asic_model: text(json, "ASICModel"),
        hostname: text(json, "hostname"),
        device_model: text(json, "deviceModel").or_else(|| text(json, "boardVersion")),
        firmware_version: text(json, "version").or_else(|| text(json, "axeOSVersion")),
        small_core_count: number(json, "smallCoreCount").map(|n| n as u32),
        asic_count: number(json, "asicCount").map(|n| n as u32),
    }
}
