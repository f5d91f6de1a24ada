use crate::backoff::Backoff;
use crate::error::ConfigError;
use bon::Builder;

/// 单个订阅的重试 / 死信 / 并发策略
///
/// 由订阅方构造，随 `subscribe` 按值交给消费运行时，订阅存续期间不可更改；
/// 调整策略需要重新订阅。
///
/// ```
/// use evbus_core::consumer::ConsumerOptions;
///
/// let options = ConsumerOptions::builder()
///     .max_retries(2)
///     .backoff_base_ms(100)
///     .dlq_topic("order.created.DLQ")
///     .build();
/// assert!(options.validate().is_ok());
/// assert_eq!(options.concurrency, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct ConsumerOptions {
    /// 0 表示只尝试一次，失败即进入死信
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = 100)]
    pub backoff_base_ms: u64,
    #[builder(default = 2.0)]
    pub backoff_multiplier: f64,
    #[builder(default = 30_000)]
    pub backoff_max_delay_ms: u64,
    /// 未设置时，重试耗尽的事件在记录日志与钩子后丢弃
    #[builder(into)]
    pub dlq_topic: Option<String>,
    /// 同时处于 Processing 的事件上限；分区日志上会被压到已分配分区数
    #[builder(default = 1)]
    pub concurrency: usize,
    /// 已接收未确认事件的上限，缺省为 `concurrency * 4`
    pub max_in_flight: Option<usize>,
    /// 取消后等待处理中事件完成的上限，缺省取总线配置
    pub drain_timeout_ms: Option<u64>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConsumerOptions {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.backoff_base_ms,
            self.backoff_multiplier,
            self.backoff_max_delay_ms,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "consumer.backoff_multiplier",
                format!("must be a finite value >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_delay_ms {
            return Err(ConfigError::invalid(
                "consumer.backoff_base_ms",
                "must not exceed backoff_max_delay_ms",
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid(
                "consumer.concurrency",
                "must be greater than zero",
            ));
        }
        if let Some(max) = self.max_in_flight {
            if max < self.concurrency {
                return Err(ConfigError::invalid(
                    "consumer.max_in_flight",
                    format!("must be at least concurrency ({})", self.concurrency),
                ));
            }
        }
        if matches!(self.dlq_topic.as_deref(), Some("")) {
            return Err(ConfigError::invalid("consumer.dlq_topic", "must not be empty"));
        }
        Ok(())
    }

    /// 死信消费者自身不再路由到死信
    pub(crate) fn without_dlq(mut self) -> Self {
        self.dlq_topic = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ConsumerOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.backoff_base_ms, 100);
        assert_eq!(options.backoff_multiplier, 2.0);
        assert_eq!(options.backoff_max_delay_ms, 30_000);
        assert_eq!(options.dlq_topic, None);
        assert_eq!(options.concurrency, 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_inconsistent_values() {
        let cases = [
            ConsumerOptions::builder().backoff_multiplier(0.5).build(),
            ConsumerOptions::builder().backoff_base_ms(10).backoff_max_delay_ms(5).build(),
            ConsumerOptions::builder().concurrency(0).build(),
            ConsumerOptions::builder().concurrency(4).max_in_flight(2).build(),
            ConsumerOptions::builder().dlq_topic("").build(),
        ];
        for options in cases {
            assert!(options.validate().is_err(), "{options:?}");
        }
    }

    #[test]
    fn without_dlq_clears_topic_only() {
        let options = ConsumerOptions::builder()
            .max_retries(5)
            .dlq_topic("x.DLQ")
            .build()
            .without_dlq();
        assert_eq!(options.dlq_topic, None);
        assert_eq!(options.max_retries, 5);
    }
}
