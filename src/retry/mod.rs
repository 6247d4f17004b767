//! 重试退避策略
//!
//! 注册发现里的重试没有次数上限，一直持续到进程退出，策略只决定两次尝试之间等待多久。

pub mod exponential;

pub use exponential::ExponentialBackoff;

use std::time::Duration;

/// 退避策略 trait
pub trait BackoffPolicy: Send + Sync {
    /// 第 `attempt` 次连续失败后的等待时间（从 0 开始）
    fn backoff_duration(&self, attempt: usize) -> Duration;
}
