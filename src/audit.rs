//! 审计/通知输出
//!
//! 每个调优动作、安全触发、优化器决策和基准测试状态变化都会产生一条
//! 带原因描述和结果设置的审计事件。

use crate::device::DeviceSettings;
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TuningAction,
    SafetyTrip,
    OptimizerDecision,
    Verification,
    Restart,
    BenchmarkTransition,
    ControlChange,
}

/// 审计事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub kind: AuditKind,
    /// 机器可读的原因码
    pub code: Option<String>,
    /// 人类可读的原因
    pub reason: String,
    /// 动作之后的设置
    pub settings: Option<DeviceSettings>,
}

impl AuditEvent {
    pub fn new(device_id: &str, kind: AuditKind, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            kind,
            code: None,
            reason: reason.into(),
            settings: None,
        }
    }

    pub fn with_settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// 审计输出
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// 写入 tracing 日志
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let settings = event
            .settings
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match event.kind {
            AuditKind::SafetyTrip => warn!(
                device = %event.device_id,
                code = event.code.as_deref().unwrap_or(""),
                "🛡️ {} -> {}", event.reason, settings
            ),
            _ => info!(
                device = %event.device_id,
                kind = ?event.kind,
                "📝 {} -> {}", event.reason, settings
            ),
        }
    }
}

/// 内存记录，供测试和界面轮询
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

/// 追加写入 JSON lines 文件
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        // 确保日志目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.display().to_string(),
                error: e.to_string(),
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                error: e.to_string(),
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }
}

/// 同时写入多个输出
#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
