//! 配置（config）
//!
//! 所有配置均可由 serde 反序列化并带有默认值；校验发生在适配器 / 总线构造时，
//! 而不是 publish / subscribe 时。
//!
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

pub use crate::backoff::RetryPolicy;

/// 日志适配器的重连策略（与发布重试同形）
pub type ReconnectPolicy = RetryPolicy;

fn default_reconnect() -> ReconnectPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 100,
        max_delay_ms: 5_000,
    }
}

fn validate_retry(field: &'static str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.base_delay_ms > policy.max_delay_ms {
        return Err(ConfigError::invalid(
            field,
            format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                policy.base_delay_ms, policy.max_delay_ms
            ),
        ));
    }
    Ok(())
}

// --- 总线 ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 普通发布与死信发布共用的重试策略（仅重试可重试的传输错误）
    pub publish_retry: RetryPolicy,
    /// 订阅未显式指定时的排空超时
    pub drain_timeout_ms: u64,
    /// 单次死信发布（含重试）的上限，超时按发布失败处理并确认原事件
    pub dead_letter_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            publish_retry: RetryPolicy::default(),
            drain_timeout_ms: 5_000,
            dead_letter_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dead_letter_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "bus.dead_letter_timeout_ms",
                "must be greater than zero",
            ));
        }
        validate_retry("bus.publish_retry", &self.publish_retry)
    }
}

// --- 内存适配器 ---

/// 有界队列写满时的行为
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 阻塞发布者直到有空位（可配合 `publish_timeout_ms`）
    #[default]
    Block,
    /// 立即返回 `TransportError::QueueFull`
    Reject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 每个订阅队列（以及无订阅者时的积压队列）的容量，缺省为无界
    pub max_queue_size: Option<usize>,
    pub overflow: OverflowPolicy,
    /// 阻塞发布的上限，超时返回 `QueueFull`
    pub publish_timeout_ms: Option<u64>,
}

impl MemoryConfig {
    pub fn bounded(max_queue_size: usize) -> Self {
        Self {
            max_queue_size: Some(max_queue_size),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == Some(0) {
            return Err(ConfigError::invalid(
                "memory.max_queue_size",
                "must be greater than zero",
            ));
        }
        if self.publish_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "memory.publish_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// --- 日志适配器 ---

/// 新消费组的起始位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionedLogConfig {
    pub partitions: u32,
    /// 每个分区未确认消息的上限
    pub max_in_flight: usize,
    /// 无数据时单次等待的时长
    pub fetch_wait_ms: u64,
    pub offset_reset: OffsetReset,
    /// 每个分区保留的记录数，缺省不裁剪
    pub retention_records: Option<usize>,
    pub reconnect: ReconnectPolicy,
}

impl Default for PartitionedLogConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_in_flight: 16,
            fetch_wait_ms: 100,
            offset_reset: OffsetReset::Earliest,
            retention_records: None,
            reconnect: default_reconnect(),
        }
    }
}

impl PartitionedLogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::invalid(
                "partitioned_log.partitions",
                "must be greater than zero",
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid(
                "partitioned_log.max_in_flight",
                "must be greater than zero",
            ));
        }
        if self.fetch_wait_ms == 0 {
            return Err(ConfigError::invalid(
                "partitioned_log.fetch_wait_ms",
                "must be greater than zero",
            ));
        }
        if self.retention_records == Some(0) {
            return Err(ConfigError::invalid(
                "partitioned_log.retention_records",
                "must be greater than zero",
            ));
        }
        validate_retry("partitioned_log.reconnect", &self.reconnect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamLogConfig {
    /// 近似裁剪上限（超出后丢弃最旧条目）
    pub max_stream_length: Option<usize>,
    /// 单个会话未确认条目的上限
    pub prefetch: usize,
    /// 待确认条目闲置超过该时长即可被组内其他消费者认领
    pub consumer_timeout_ms: u64,
    pub fetch_wait_ms: u64,
    pub start_from: OffsetReset,
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamLogConfig {
    fn default() -> Self {
        Self {
            max_stream_length: None,
            prefetch: 16,
            consumer_timeout_ms: 30_000,
            fetch_wait_ms: 100,
            start_from: OffsetReset::Earliest,
            reconnect: default_reconnect(),
        }
    }
}

impl StreamLogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::invalid(
                "stream_log.prefetch",
                "must be greater than zero",
            ));
        }
        if self.max_stream_length == Some(0) {
            return Err(ConfigError::invalid(
                "stream_log.max_stream_length",
                "must be greater than zero",
            ));
        }
        if self.consumer_timeout_ms == 0 || self.fetch_wait_ms == 0 {
            return Err(ConfigError::invalid(
                "stream_log.consumer_timeout_ms",
                "timeouts must be greater than zero",
            ));
        }
        validate_retry("stream_log.reconnect", &self.reconnect)
    }
}

// --- 选择器 ---

/// 适配器选择（由工厂在构造时解析）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    Memory(MemoryConfig),
    PartitionedLog(PartitionedLogConfig),
    StreamLog(StreamLogConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Memory(c) => c.validate(),
            Self::PartitionedLog(c) => c.validate(),
            Self::StreamLog(c) => c.validate(),
        }
    }
}

/// 完整的总线配置文档
///
/// ```
/// use evbus_core::config::{AdapterConfig, EventBusSettings};
///
/// let settings = EventBusSettings::from_json_str(
///     r#"{"adapter": {"kind": "memory", "max_queue_size": 8}}"#,
/// )
/// .unwrap();
/// assert!(matches!(settings.adapter, AdapterConfig::Memory(ref m) if m.max_queue_size == Some(8)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusSettings {
    pub bus: BusConfig,
    pub adapter: AdapterConfig,
}

impl EventBusSettings {
    /// 解析并校验
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        self.adapter.validate()
    }
}
