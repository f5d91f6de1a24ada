//! 退避计算
//!
//! `delay(attempt) = min(base × multiplier^(attempt-1), max)`，纯函数，
//! 不依赖任何运行时状态；`attempt` 从 1 开始。
//!
//! `RetryPolicy` 复用同一公式，用于发布重试与日志适配器的重连。
//!
use crate::consumer::ConsumerOptions;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// 指数退避参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            base_ms,
            multiplier,
            max_delay_ms,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0).round() as u64)
    }
}

/// 第 `attempt` 次失败后的重投延迟
pub fn delay(attempt: u32, options: &ConsumerOptions) -> Duration {
    options.backoff().delay(attempt)
}

/// 有限次数的重试策略（倍数固定为 2）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次），0 与 1 等价
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay_ms, 2.0, self.max_delay_ms)
    }

    /// 执行 `op`，对 `retryable` 判定为瞬时的错误按退避重试，耗尽后返回最后一次错误
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && retryable(&err) => {
                    let delay = self.backoff().delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
