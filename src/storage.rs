//! 配置档案与遥测历史的持久化

use crate::benchmark::BenchmarkProfile;
use crate::device::TelemetrySample;
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// 按设备标识存取基准测试档案和遥测历史
pub trait ProfileStore: Send + Sync {
    fn load_profile(&self, device_id: &str) -> Result<Option<BenchmarkProfile>, StorageError>;

    /// 整体替换，从不原地修改
    fn save_profile(&self, profile: &BenchmarkProfile) -> Result<(), StorageError>;

    fn load_history(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySample>, StorageError>;

    fn append_history(&self, device_id: &str, sample: &TelemetrySample) -> Result<(), StorageError>;
}

/// 基于文件的存储
///
/// - `<root>/profiles/<device>.json`
/// - `<root>/history/<device>.jsonl`
pub struct JsonFileStore {
    root: PathBuf,
    // 同一进程内串行化追加写
    append_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join("profiles"), root.join("history")] {
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(Self {
            root,
            append_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_path(&self, device_id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{}.json", file_stem(device_id)))
    }

    fn history_path(&self, device_id: &str) -> PathBuf {
        self.root.join("history").join(format!("{}.jsonl", file_stem(device_id)))
    }
}

impl ProfileStore for JsonFileStore {
    fn load_profile(&self, device_id: &str) -> Result<Option<BenchmarkProfile>, StorageError> {
        let path = self.profile_path(device_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let profile = serde_json::from_str(&content).map_err(|e| StorageError::Serialization {
            error: e.to_string(),
        })?;
        Ok(Some(profile))
    }

    fn save_profile(&self, profile: &BenchmarkProfile) -> Result<(), StorageError> {
        let path = self.profile_path(&profile.device_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(profile).map_err(|e| StorageError::Serialization {
            error: e.to_string(),
        })?;

        fs::write(&tmp, content).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        debug!("💾 Saved benchmark profile to {}", path.display());
        Ok(())
    }

    fn load_history(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySample>, StorageError> {
        let path = self.history_path(device_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).map_err(|e| io_error(&path, e))?;

        let mut samples = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetrySample>(&line) {
                Ok(sample) if sample.timestamp >= from && sample.timestamp <= to => samples.push(sample),
                Ok(_) => {}
                // 进程中断可能留下半行
                Err(e) => warn!("Skipping corrupt history line {} in {}: {}", index + 1, path.display(), e),
            }
        }
        Ok(samples)
    }

    fn append_history(&self, device_id: &str, sample: &TelemetrySample) -> Result<(), StorageError> {
        let path = self.history_path(device_id);
        let line = serde_json::to_string(sample).map_err(|e| StorageError::Serialization {
            error: e.to_string(),
        })?;

        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        writeln!(file, "{}", line).map_err(|e| io_error(&path, e))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        error: error.to_string(),
    }
}

/// 设备标识可能是 IP 或主机名，替换掉不适合做文件名的字符
pub(crate) fn file_stem(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{BenchmarkMode, StopReason};
    use crate::device::DeviceSettings;
    use chrono::Duration;
    use uuid::Uuid;

    fn temp_store() -> (JsonFileStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("asic-tuner-store-{}", Uuid::new_v4()));
        (JsonFileStore::new(&root).unwrap(), root)
    }

    fn sample_at(ts: DateTime<Utc>, hashrate: f64) -> TelemetrySample {
        TelemetrySample {
            hashrate: Some(hashrate),
            ..TelemetrySample::empty(ts)
        }
    }

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("192.168.1.20"), "192.168.1.20");
        assert_eq!(file_stem("http://gamma:80"), "http___gamma_80");
    }

    #[test]
    fn test_profile_replaced_wholesale() {
        let (store, root) = temp_store();
        assert!(store.load_profile("gamma").unwrap().is_none());

        let mut profile = BenchmarkProfile {
            device_id: "gamma".to_string(),
            mode: BenchmarkMode::Quick,
            completed_at: None,
            best_hashrate: None,
            best_efficiency: None,
            safe_limits: None,
            stop_reason: StopReason::Completed,
            applied_settings: Some(DeviceSettings::new(525, 1150)),
            results: Vec::new(),
        };
        store.save_profile(&profile).unwrap();

        profile.applied_settings = Some(DeviceSettings::new(600, 1200));
        store.save_profile(&profile).unwrap();

        let loaded = store.load_profile("gamma").unwrap().unwrap();
        assert_eq!(loaded.applied_settings, Some(DeviceSettings::new(600, 1200)));
        assert!(!root.join("profiles").join("gamma.json.tmp").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_history_range_filter() {
        let (store, root) = temp_store();
        let now = Utc::now();
        for minutes in [30, 20, 10, 0] {
            store
                .append_history("gamma", &sample_at(now - Duration::minutes(minutes), minutes as f64))
                .unwrap();
        }

        let recent = store
            .load_history("gamma", now - Duration::minutes(15), now)
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].hashrate, Some(10.0));
        assert!(store.load_history("other", now - Duration::hours(1), now).unwrap().is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_history_skips_corrupt_lines() {
        let (store, root) = temp_store();
        let now = Utc::now();
        store.append_history("gamma", &sample_at(now, 1.0)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.history_path("gamma"))
            .unwrap();
        writeln!(file, "{{\"timestamp\":").unwrap();

        let loaded = store.load_history("gamma", now - Duration::minutes(1), now).unwrap();
        assert_eq!(loaded.len(), 1);

        let _ = fs::remove_dir_all(&root);
    }
}
