//! ASIC-Tuner - 网络 ASIC 矿机的自适应调优与基准测试
//!
//! 通过设备的 HTTP 接口调节频率和核心电压，在算力、温度和稳定性之间取得平衡：
//! - 自适应调优循环（每台设备一个持续运行的反馈控制器）
//! - 基准测试引擎（按需扫描，刻画设备的安全工作范围）
//!
//! ## 架构特点
//!
//! ### 设备配置解析
//! - 有序的芯片/设备匹配表，首个匹配生效
//! - 设备覆盖字段遮蔽芯片默认值
//! - 未识别芯片回退到保守边界
//!
//! ### 多层安全联锁
//! - 输入欠压、芯片/VR 临界温度时强制安全设置
//! - 每次调整后校验算力，下降则回滚
//! - 基准测试违反安全包络立即停止并写回已测试过的设置
//!
//! ### 独立的设备任务
//! - 每台设备独占自己的调优状态
//! - 基准测试通过暂停/恢复广播与调优互斥

pub mod audit;
pub mod benchmark;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod logging;
pub mod profile;
pub mod storage;
pub mod tuner;

pub use benchmark::{aggregate, BenchmarkEngine, BenchmarkMode, BenchmarkProfile, BenchmarkSummary};
pub use config::Config;
pub use control::TunerControl;
pub use device::{DeviceClient, DeviceSettings, HttpDeviceClient, TelemetrySample, VirtualDevice};
pub use error::TunerError;
pub use profile::{ProfileResolver, ResolvedProfile, TuningBounds, TuningCapability};
pub use storage::{JsonFileStore, ProfileStore};
pub use tuner::{AutoTuner, TunerManager};

/// 程序版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 程序名称
pub const NAME: &str = "asic-tuner";
