use crate::benchmark::{BenchmarkConfig, BenchmarkMode};
use crate::tuner::AutoTuneSettings;
use crate::error::ConfigError;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "asic-tuner.toml")]
    pub config: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Continuously tune every configured device
    Run {
        /// Use simulated devices instead of the network
        #[arg(long)]
        simulate: bool,
    },
    /// Run a benchmark sweep on one device
    Benchmark {
        /// Device id from the configuration
        #[arg(short = 'D', long)]
        device: String,
        /// Search strategy
        #[arg(short, long, value_enum)]
        mode: Option<BenchmarkMode>,
        /// Use a simulated device instead of the network
        #[arg(long)]
        simulate: bool,
    },
    /// Print the resolved tuning profile for a chip/device
    Profile {
        /// Chip model, e.g. BM1370
        #[arg(long)]
        chip: Option<String>,
        /// Device model or hostname
        #[arg(long)]
        device: Option<String>,
    },
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tuner: AutoTuneSettings,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// never / hourly / daily
    pub log_rotation: String,
    pub json_logs: bool,
    /// 配置文件和遥测历史的存放目录
    pub data_dir: PathBuf,
    /// 审计日志 (JSON lines)
    pub audit_log: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            log_rotation: "daily".to_string(),
            json_logs: false,
            data_dir: PathBuf::from("./data"),
            audit_log: Some(PathBuf::from("./data/audit.jsonl")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 单次设备调用超时 (秒)
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    /// IP、主机名或完整 URL
    pub address: String,
    /// 已知时可省略自动探测
    pub chip_model: Option<String>,
    pub device_model: Option<String>,
    #[serde(default = "default_true")]
    pub auto_tune: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            http: HttpConfig::default(),
            tuner: AutoTuneSettings::default(),
            benchmark: BenchmarkConfig::default(),
            devices: vec![DeviceEntry {
                id: "bitaxe-1".to_string(),
                address: "192.168.1.50".to_string(),
                chip_model: None,
                device_model: None,
                auto_tune: true,
            }],
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => anyhow::Error::new(ConfigError::FileNotFound {
                path: path.to_string(),
            }),
            _ => anyhow::Error::new(e).context(format!("Failed to read config file: {}", path)),
        })?;

        let config: Config = toml::from_str(&config_content)
            .map_err(|e| ConfigError::ParseError { error: e.to_string() })
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // 验证设备列表
        let mut ids = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.id.trim().is_empty() {
                bail!(ConfigError::MissingField {
                    field: format!("devices[{}].id", index),
                });
            }
            if device.address.trim().is_empty() {
                bail!(ConfigError::MissingField {
                    field: format!("devices[{}].address", index),
                });
            }
            if !ids.insert(device.id.as_str()) {
                bail!(invalid("devices.id", &device.id, "duplicate device id"));
            }
        }

        crate::logging::LogRotation::parse(&self.general.log_rotation)?;

        if self.http.timeout_secs == 0 || self.http.timeout_secs > 120 {
            bail!(invalid("http.timeout_secs", self.http.timeout_secs, "must be within 1-120"));
        }

        // 验证调优参数
        let tuner = &self.tuner;
        if tuner.sample_interval_secs == 0 {
            bail!(invalid("tuner.sample_interval_secs", 0, "must be greater than 0"));
        }
        if tuner.hysteresis_c <= 0.0 {
            bail!(invalid("tuner.hysteresis_c", tuner.hysteresis_c, "must be positive"));
        }
        if tuner.flatline_detection && tuner.flatline_samples < 2 {
            bail!(invalid(
                "tuner.flatline_samples",
                tuner.flatline_samples,
                "flatline detection needs at least 2 samples"
            ));
        }
        if tuner.history_window < tuner.flatline_samples {
            bail!(rule(
                "tuner.history_window",
                format!(
                    "window {} is smaller than flatline sample count {}",
                    tuner.history_window, tuner.flatline_samples
                )
            ));
        }
        if tuner.optimize_every_cycles > 0 && tuner.history_window < tuner.optimize_every_cycles as usize {
            bail!(rule(
                "tuner.history_window",
                format!(
                    "window {} cannot hold {} optimizer cycles",
                    tuner.history_window, tuner.optimize_every_cycles
                )
            ));
        }
        if !(0.0..100.0).contains(&tuner.revert_drop_percent) {
            bail!(invalid(
                "tuner.revert_drop_percent",
                tuner.revert_drop_percent,
                "must be between 0 and 100"
            ));
        }
        if tuner.safe_voltage_mv == 0 || tuner.safe_frequency_mhz == 0 {
            bail!(invalid(
                "tuner.safe_settings",
                format!("{}MHz/{}mV", tuner.safe_frequency_mhz, tuner.safe_voltage_mv),
                "safe defaults must be non-zero"
            ));
        }

        // 验证基准测试参数
        let bench = &self.benchmark;
        if bench.sample_interval_secs == 0 {
            bail!(invalid("benchmark.sample_interval_secs", 0, "must be greater than 0"));
        }
        let needed = bench.sample_interval_secs * bench.min_samples as u64;
        if bench.test_duration_secs < needed {
            bail!(rule(
                "benchmark.test_duration_secs",
                format!(
                    "{}s cannot produce {} samples at {}s intervals",
                    bench.test_duration_secs, bench.min_samples, bench.sample_interval_secs
                )
            ));
        }
        if bench.overclock_test_duration_secs < needed {
            bail!(rule(
                "benchmark.overclock_test_duration_secs",
                format!(
                    "{}s cannot produce {} samples at {}s intervals",
                    bench.overclock_test_duration_secs, bench.min_samples, bench.sample_interval_secs
                )
            ));
        }
        if bench.stability_ratio <= 0.0 || bench.stability_ratio > 1.0 {
            bail!(invalid("benchmark.stability_ratio", bench.stability_ratio, "must be in (0, 1]"));
        }
        if bench.min_input_voltage_mv >= bench.max_input_voltage_mv {
            bail!(ConfigError::InvertedBounds {
                field: "benchmark.input_voltage_mv".to_string(),
                min: bench.min_input_voltage_mv,
                max: bench.max_input_voltage_mv,
            });
        }
        if bench.multi_chip_min_input_voltage_mv >= bench.multi_chip_max_input_voltage_mv {
            bail!(ConfigError::InvertedBounds {
                field: "benchmark.multi_chip_input_voltage_mv".to_string(),
                min: bench.multi_chip_min_input_voltage_mv,
                max: bench.multi_chip_max_input_voltage_mv,
            });
        }
        if bench.voltage_step_mv == 0 || bench.frequency_step_mhz == 0 {
            bail!(invalid(
                "benchmark.step",
                format!("{}MHz/{}mV", bench.frequency_step_mhz, bench.voltage_step_mv),
                "step sizes must be greater than 0"
            ));
        }
        if bench.max_temp_exceeds == 0 {
            bail!(invalid("benchmark.max_temp_exceeds", 0, "must be at least 1"));
        }

        Ok(())
    }

    /// 检查配置是否有效
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn device(&self, id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.id == id)
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn rule(field: &str, reason: String) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason,
    }
}
