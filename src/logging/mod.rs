//! 日志系统

use crate::config::GeneralConfig;
use crate::error::ConfigError;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
    /// 日志文件路径
    pub file_path: Option<String>,
    /// 控制台输出 JSON
    pub json: bool,
    /// 是否启用彩色输出
    pub colored: bool,
    /// 是否显示目标模块
    pub show_target: bool,
    /// 日志轮转配置
    pub rotation: LogRotation,
}

/// 日志轮转配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    Daily,
}

impl LogRotation {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "never" => Ok(LogRotation::Never),
            "hourly" => Ok(LogRotation::Hourly),
            "daily" => Ok(LogRotation::Daily),
            other => Err(ConfigError::InvalidValue {
                field: "general.log_rotation".to_string(),
                value: other.to_string(),
                reason: "expected never, hourly or daily".to_string(),
            }),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json: false,
            colored: true,
            show_target: false,
            rotation: LogRotation::Daily,
        }
    }
}

impl LogConfig {
    /// 由配置文件的 general 段构建，命令行参数可覆盖级别和格式
    pub fn from_general(general: &GeneralConfig, level: Option<&str>, json: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            level: level.unwrap_or(&general.log_level).to_string(),
            file_path: general.log_file.as_ref().map(|p| p.display().to_string()),
            json: json || general.json_logs,
            rotation: LogRotation::parse(&general.log_rotation)?,
            ..Self::default()
        })
    }

    fn level_filter(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// 初始化日志系统
///
/// 返回的守卫必须在进程存活期间保持，否则文件日志会丢失尾部内容。
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let env_filter = EnvFilter::from_default_env().add_directive(config.level_filter().into());
    let registry = tracing_subscriber::registry().with(env_filter);

    // 控制台输出层
    let console_layer = if config.json {
        fmt::layer().with_target(config.show_target).json().boxed()
    } else {
        fmt::layer()
            .with_ansi(config.colored)
            .with_target(config.show_target)
            .boxed()
    };

    // 文件输出层
    let Some(file_path) = config.file_path.as_deref() else {
        registry.with(console_layer).init();
        return Ok(None);
    };

    let file_path = Path::new(file_path);
    let directory = file_path.parent().unwrap_or(Path::new("."));
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("asic-tuner.log");

    let (writer, guard) = match config.rotation {
        LogRotation::Never => {
            std::fs::create_dir_all(directory).map_err(|e| ConfigError::InvalidValue {
                field: "general.log_file".to_string(),
                value: file_path.display().to_string(),
                reason: e.to_string(),
            })?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)
                .map_err(|e| ConfigError::InvalidValue {
                    field: "general.log_file".to_string(),
                    value: file_path.display().to_string(),
                    reason: e.to_string(),
                })?;
            non_blocking(file)
        }
        LogRotation::Hourly => non_blocking(rolling::hourly(directory, file_name)),
        LogRotation::Daily => non_blocking(rolling::daily(directory, file_name)),
    };

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .json();

    registry.with(console_layer).with(file_layer).init();
    Ok(Some(guard))
}
