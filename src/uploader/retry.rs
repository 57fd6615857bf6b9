// 重试策略
//
// 指数退避：wait = min(max_wait, initial_wait * multiplier^(attempt-1))
//
// 延迟序列（默认配置 1s / x2 / 100s）：
// - attempt=1: 1s
// - attempt=2: 2s
// - attempt=3: 4s
// - ...
// - 最大: 100s

use super::error::UploadError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 重试策略配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// 第一次失败后的等待时间（秒）
    #[serde(default = "default_initial_wait_time_seconds")]
    pub initial_wait_time_seconds: u64,
    /// 两次尝试之间的最大等待时间（秒）
    #[serde(default = "default_max_wait_time_seconds")]
    pub max_wait_time_seconds: u64,
    /// 退避倍数
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// 默认最大重试次数（单个请求可覆盖）
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_initial_wait_time_seconds() -> u64 {
    1
}

fn default_max_wait_time_seconds() -> u64 {
    100
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            initial_wait_time_seconds: default_initial_wait_time_seconds(),
            max_wait_time_seconds: default_max_wait_time_seconds(),
            multiplier: default_multiplier(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.multiplier < 1 {
            return Err(UploadError::configuration("退避倍数必须 >= 1"));
        }
        if self.max_wait_time_seconds < self.initial_wait_time_seconds {
            return Err(UploadError::configuration(format!(
                "最大等待时间 ({}s) 不能小于初始等待时间 ({}s)",
                self.max_wait_time_seconds, self.initial_wait_time_seconds
            )));
        }
        Ok(())
    }
}

/// 重试策略
///
/// 纯计算，不持有可变状态，可被所有任务共享
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self, UploadError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// 计算第 `attempt` 次尝试（从 1 开始）失败后的等待时间
    pub fn wait_time(&self, attempt: u32) -> Duration {
        let max = self.config.max_wait_time_seconds;
        let mut wait = self.config.initial_wait_time_seconds.min(max);
        let multiplier = u64::from(self.config.multiplier);

        if wait == 0 || multiplier <= 1 {
            return Duration::from_secs(wait);
        }

        // 达到上限后不再相乘，attempt 再大也不会溢出
        for _ in 1..attempt.max(1) {
            if wait >= max {
                break;
            }
            wait = wait.saturating_mul(multiplier).min(max);
        }

        Duration::from_secs(wait)
    }

    /// 决定第 `attempt` 次尝试失败后是否重试
    ///
    /// # 返回
    /// - `Some(wait)`：等待 `wait` 后重试
    /// - `None`：重试次数已用完
    pub fn next_retry(&self, attempt: u32, max_retries: u32) -> Option<Duration> {
        if attempt > max_retries {
            None
        } else {
            Some(self.wait_time(attempt))
        }
    }

    /// 单个请求的最大重试次数，未覆盖时使用默认值
    pub fn max_retries(&self, request_override: Option<u32>) -> u32 {
        request_override.unwrap_or(self.config.default_max_retries)
    }
}
