use super::{DeviceInfo, DeviceSettings, TelemetrySample};
use crate::error::DeviceError;
use async_trait::async_trait;

/// 设备遥测/控制接口
///
/// 所有调用都可能失败；调用方负责用 [`super::with_timeout`] 加上超时。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// 设备标识 (配置中的 id)
    fn device_id(&self) -> &str;

    /// 获取设备身份信息
    async fn get_info(&self) -> Result<DeviceInfo, DeviceError>;

    /// 获取最新遥测
    async fn get_telemetry(&self) -> Result<TelemetrySample, DeviceError>;

    /// 下发频率/电压
    async fn apply_settings(&self, settings: DeviceSettings) -> Result<(), DeviceError>;

    /// 重启设备
    async fn restart(&self) -> Result<(), DeviceError>;
}
