use crate::device::TelemetrySample;
use std::collections::VecDeque;

/// 有界的滚动遥测历史
#[derive(Debug, Clone)]
pub struct TelemetryHistory {
    samples: VecDeque<TelemetrySample>,
    capacity: usize,
}

impl TelemetryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn from_samples(capacity: usize, samples: impl IntoIterator<Item = TelemetrySample>) -> Self {
        let mut history = Self::new(capacity);
        for sample in samples {
            history.push(sample);
        }
        history
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TelemetrySample> + ExactSizeIterator {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// 最近 `count` 个算力完全相同且非零
    pub fn is_flatlined(&self, count: usize) -> bool {
        if count < 2 || self.samples.len() < count {
            return false;
        }

        let mut recent = self.samples.iter().rev().take(count).map(|s| s.hashrate);
        let first = match recent.next().flatten() {
            Some(h) if h != 0.0 => h,
            _ => return false,
        };
        recent.all(|h| h == Some(first))
    }
}
