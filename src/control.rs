//! 暂停/恢复通道
//!
//! 基准测试开始时广播 Pause，结束时广播 Resume；调优任务在每次 tick
//! 之前检查。这是协作式的通知而不是锁，一次 tick 总是完整执行。
//!
//! 配置了标记目录时，暂停状态同时写成 `<dir>/<device>.pause` 文件，
//! 这样另一个进程里的基准测试也能让调优任务让出设备。

use crate::storage::file_stem;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 超过这个时长的暂停标记视为崩溃遗留，不再生效
const STALE_MARKER_HOURS: i64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSignal {
    pub device_id: String,
    pub action: ControlAction,
    pub reason: String,
}

/// 暂停标记文件的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseMarker {
    pub device_id: String,
    pub reason: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// 按设备标识寻址的暂停/恢复广播
#[derive(Clone)]
pub struct TunerControl {
    sender: broadcast::Sender<ControlSignal>,
    paused: Arc<Mutex<HashSet<String>>>,
    marker_dir: Option<PathBuf>,
}

impl Default for TunerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerControl {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            paused: Arc::new(Mutex::new(HashSet::new())),
            marker_dir: None,
        }
    }

    /// 启用跨进程暂停标记
    pub fn with_marker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Cannot create pause marker directory {}: {}", dir.display(), e);
        }
        self.marker_dir = Some(dir);
        self
    }

    pub fn marker_dir(&self) -> Option<&Path> {
        self.marker_dir.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlSignal> {
        self.sender.subscribe()
    }

    pub fn pause(&self, device_id: &str, reason: &str) {
        self.paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string());
        self.write_marker(device_id, reason);
        info!("⏸️ Pausing tuner for {}: {}", device_id, reason);
        self.send(device_id, ControlAction::Pause, reason);
    }

    pub fn resume(&self, device_id: &str, reason: &str) {
        self.paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        self.remove_marker(device_id);
        info!("▶️ Resuming tuner for {}: {}", device_id, reason);
        self.send(device_id, ControlAction::Resume, reason);
    }

    /// 当前是否处于暂停状态：本进程的暂停或其他进程留下的有效标记
    pub fn is_paused(&self, device_id: &str) -> bool {
        let local = self
            .paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id);
        local || self.marker_active(device_id, Utc::now())
    }

    /// 暂停并返回守卫；守卫释放时自动恢复
    pub fn pause_guard(&self, device_id: &str, reason: &str) -> PauseGuard {
        self.pause(device_id, reason);
        PauseGuard {
            control: self.clone(),
            device_id: device_id.to_string(),
        }
    }

    fn marker_path(&self, device_id: &str) -> Option<PathBuf> {
        self.marker_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.pause", file_stem(device_id))))
    }

    fn write_marker(&self, device_id: &str, reason: &str) {
        let Some(path) = self.marker_path(device_id) else {
            return;
        };
        let marker = PauseMarker {
            device_id: device_id.to_string(),
            reason: reason.to_string(),
            pid: std::process::id(),
            created_at: Utc::now(),
        };
        let written = serde_json::to_vec_pretty(&marker)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(&path, bytes));
        if let Err(e) = written {
            warn!("Failed to write pause marker {}: {}", path.display(), e);
        }
    }

    fn remove_marker(&self, device_id: &str) {
        let Some(path) = self.marker_path(device_id) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove pause marker {}: {}", path.display(), e),
        }
    }

    fn marker_active(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        let Some(path) = self.marker_path(device_id) else {
            return false;
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return false,
            Err(e) => {
                warn!("Cannot read pause marker {}: {}", path.display(), e);
                return true;
            }
        };
        match serde_json::from_slice::<PauseMarker>(&bytes) {
            Ok(marker) if now - marker.created_at > ChronoDuration::hours(STALE_MARKER_HOURS) => {
                warn!(
                    "Ignoring stale pause marker for {} from pid {} ({})",
                    device_id, marker.pid, marker.created_at
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                // 写了一半的标记也算暂停
                warn!("Unreadable pause marker {}: {}", path.display(), e);
                true
            }
        }
    }

    fn send(&self, device_id: &str, action: ControlAction, reason: &str) {
        let signal = ControlSignal {
            device_id: device_id.to_string(),
            action,
            reason: reason.to_string(),
        };
        if let Err(e) = self.sender.send(signal) {
            // 没有订阅者时发送失败是正常的
            debug!("No tuner listening for control signal: {}", e);
        }
    }
}

/// 离开作用域时恢复调优
pub struct PauseGuard {
    control: TunerControl,
    device_id: String,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.control.resume(&self.device_id, "benchmark finished");
    }
}
