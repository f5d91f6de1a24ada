//! 事件总线统一错误定义
//!
//! 按“生产端 / 传输层 / 消费端 / 请求应答 / 配置”划分最小必要集合：
//! - `EncodeError`：生产端序列化或 Schema 校验失败，不可重试；
//! - `TransportError`：适配器 I/O 故障，可重试；
//! - `HandlerError`：消费端处理失败，驱动重试与死信；
//! - `TimeoutError` / `UnsupportedOperation`：仅出现在请求应答路径；
//! - `BusError`：对外统一出口，便于上层用 `?` 汇聚。
//!
use std::time::Duration;
use thiserror::Error;

// --- 生产端 ---

/// 编码错误（不可重试，绝不进入死信队列）
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("schema validation failed: topic={topic}, reason={reason}")]
    Validation { topic: String, reason: String },
    #[error("serialization error: topic={topic}, reason={source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 解码错误（消费端拿到无法还原的载荷）
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("deserialization error: topic={topic}, reason={source}")]
    Deserialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid dead letter entry: {reason}")]
    InvalidDlqEntry { reason: String },
}

// --- 传输层 ---

/// 适配器 I/O 错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("queue full: topic={topic}")]
    QueueFull { topic: String },
    #[error("broker error: {reason}")]
    Broker { reason: String },
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    /// 是否值得原样重试（`QueueFull` 是背压信号，`Closed` 是终态）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Broker { .. })
    }
}

/// 发布错误：调用方据此区分“可重试的传输故障”与“不可重试的编码故障”
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Encode(_) => false,
            Self::Transport(err) => err.is_retryable(),
        }
    }
}

// --- 消费端 ---

/// 处理器失败（含被捕获的 panic）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event handler error: handler={handler}, reason={reason}")]
pub struct HandlerError {
    pub handler: String,
    pub reason: String,
}

// --- 请求应答 ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request timed out: topic={topic}, timeout={timeout:?}")]
pub struct TimeoutError {
    pub topic: String,
    pub timeout: Duration,
}

/// 适配器能力不匹配（如在日志型适配器上发起请求应答）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported operation: adapter={adapter}, operation={operation}")]
pub struct UnsupportedOperation {
    pub adapter: &'static str,
    pub operation: &'static str,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOperation),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("request has no reply channel: event_id={event_id}")]
    NoReplyChannel { event_id: String },
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        RequestError::Publish(PublishError::Transport(err))
    }
}

// --- 配置 ---

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: field={field}, reason={reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// --- 统一出口 ---

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("publish: {0}")]
    Publish(#[from] PublishError),
    #[error("request: {0}")]
    Request(#[from] RequestError),
    #[error("event bus closed")]
    Closed,
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;
