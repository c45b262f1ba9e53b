//! 算力校验：调整后等待一段时间，比较算力变化，必要时回滚

use super::PendingVerification;
use crate::device::DeviceSettings;

/// 校验结论
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationVerdict {
    /// 算力下降超过阈值，回滚到之前的设置
    Revert { to: DeviceSettings, change_percent: f64 },
    /// 算力提升超过阈值
    Improved { change_percent: f64 },
    /// 变化在阈值内
    Stable { change_percent: f64 },
    /// 保护性调整即使算力下降也保留
    ProtectiveKept { change_percent: f64 },
}

impl VerificationVerdict {
    pub fn change_percent(&self) -> f64 {
        match self {
            VerificationVerdict::Revert { change_percent, .. }
            | VerificationVerdict::Improved { change_percent }
            | VerificationVerdict::Stable { change_percent }
            | VerificationVerdict::ProtectiveKept { change_percent } => *change_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashrateVerifier {
    /// 下降超过该百分比则回滚
    pub revert_drop_percent: f64,
    /// 提升超过该百分比视为成功
    pub improvement_percent: f64,
}

impl HashrateVerifier {
    pub fn new(revert_drop_percent: f64, improvement_percent: f64) -> Self {
        Self {
            revert_drop_percent,
            improvement_percent,
        }
    }

    pub fn evaluate(&self, pending: &PendingVerification, current_hashrate: f64) -> VerificationVerdict {
        let change_percent = percent_change(pending.hashrate_before_change, current_hashrate);

        if change_percent <= -self.revert_drop_percent {
            if pending.protective {
                VerificationVerdict::ProtectiveKept { change_percent }
            } else {
                VerificationVerdict::Revert {
                    to: pending.previous,
                    change_percent,
                }
            }
        } else if change_percent >= self.improvement_percent {
            VerificationVerdict::Improved { change_percent }
        } else {
            VerificationVerdict::Stable { change_percent }
        }
    }
}

/// 相对变化百分比；基线为 0 时按 0 → 正值视为 +100%
pub fn percent_change(before: f64, after: f64) -> f64 {
    if before > 0.0 {
        (after - before) / before * 100.0
    } else if after > 0.0 {
        100.0
    } else {
        0.0
    }
}
