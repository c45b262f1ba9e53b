use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Safety limit exceeded: {0}")]
    Safety(#[from] SafetyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Insufficient data: {0}")]
    InsufficientData(Rejection),
}

/// 设备通信错误 (超时 / 不可达 / 响应格式错误)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device timeout: {device_id} after {timeout_ms}ms")]
    Timeout { device_id: String, timeout_ms: u64 },

    #[error("Device unreachable: {device_id}, error: {error}")]
    Unreachable { device_id: String, error: String },

    #[error("Malformed response from {device_id}: {error}")]
    Malformed { device_id: String, error: String },

    #[error("HTTP error from {device_id}: {status_code}, message: {message}")]
    Http { device_id: String, status_code: u16, message: String },

    #[error("Invalid device address: {address}")]
    InvalidAddress { address: String },
}

/// 安全限制触发
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    #[error("Chip temperature {value:.1}°C reached limit {limit:.1}°C")]
    ChipTemperature { value: f64, limit: f64 },

    #[error("VR temperature {value:.1}°C reached limit {limit:.1}°C")]
    VrTemperature { value: f64, limit: f64 },

    #[error("Power {value:.1}W exceeds limit {limit:.1}W")]
    Power { value: f64, limit: f64 },

    #[error("Input voltage {value:.0}mV below minimum {limit:.0}mV")]
    InputVoltageLow { value: f64, limit: f64 },

    #[error("Input voltage {value:.0}mV above maximum {limit:.0}mV")]
    InputVoltageHigh { value: f64, limit: f64 },

    #[error("Sensor fault: {sensor} reported {value}")]
    SensorFault { sensor: String, value: f64 },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Parse error: {error}")]
    ParseError { error: String },

    #[error("Validation error: {field}, reason: {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value: {field}, value: {value}, reason: {reason}")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Inverted bounds: {field} min {min} > max {max}")]
    InvertedBounds { field: String, min: f64, max: f64 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {error}")]
    Io { path: String, error: String },

    #[error("Serialization error: {error}")]
    Serialization { error: String },
}

/// 拒绝原因：机器可读的原因码 + 人类可读的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub message: String,
}

impl Rejection {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl TunerError {
    /// 机器可读的错误码
    pub fn code(&self) -> &str {
        match self {
            TunerError::Device(e) => e.code(),
            TunerError::Safety(e) => e.code(),
            TunerError::Config(e) => e.code(),
            TunerError::Storage(_) => "storage_error",
            TunerError::InsufficientData(r) => &r.code,
        }
    }
}

impl DeviceError {
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Timeout { .. } => "connection_timeout",
            DeviceError::Unreachable { .. } => "connection_unreachable",
            DeviceError::Malformed { .. } => "connection_malformed",
            DeviceError::Http { .. } => "connection_http_status",
            DeviceError::InvalidAddress { .. } => "connection_invalid_address",
        }
    }
}

impl SafetyError {
    pub fn code(&self) -> &'static str {
        match self {
            SafetyError::ChipTemperature { .. } => "safety_chip_temperature",
            SafetyError::VrTemperature { .. } => "safety_vr_temperature",
            SafetyError::Power { .. } => "safety_power",
            SafetyError::InputVoltageLow { .. } => "safety_input_voltage_low",
            SafetyError::InputVoltageHigh { .. } => "safety_input_voltage_high",
            SafetyError::SensorFault { .. } => "safety_sensor_fault",
        }
    }
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::FileNotFound { .. } => "config_file_not_found",
            ConfigError::ParseError { .. } => "config_parse_error",
            ConfigError::ValidationError { .. } => "config_validation_error",
            ConfigError::MissingField { .. } => "config_missing_field",
            ConfigError::InvalidValue { .. } => "config_invalid_value",
            ConfigError::InvertedBounds { .. } => "config_inverted_bounds",
        }
    }
}

// 错误统计
#[derive(Debug, Default, Clone)]
pub struct ErrorStats {
    pub device_errors: u64,
    pub safety_errors: u64,
    pub config_errors: u64,
    pub storage_errors: u64,
    pub total_errors: u64,
}

impl ErrorStats {
    pub fn record_error(&mut self, error: &TunerError) {
        self.total_errors += 1;

        match error {
            TunerError::Device(_) => self.device_errors += 1,
            TunerError::Safety(_) => self.safety_errors += 1,
            TunerError::Config(_) => self.config_errors += 1,
            TunerError::Storage(_) => self.storage_errors += 1,
            TunerError::InsufficientData(_) => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}
