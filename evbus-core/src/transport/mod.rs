//! 传输适配器（transport）
//!
//! 每个后端实现同一组契约：
//! - `TransportAdapter::publish` 返回 `Ack`；
//! - `open_subscription(topic, group)` 返回独占的 `SubscriptionSession`；
//! - 会话上的 `recv / poll / ack / nack / close`。
//!
//! 订阅内部状态（分组、分区偏移、队列游标）完全由适配器持有，
//! 消费运行时只通过 `DeliveryTag` 与之交互。请求应答是可选能力，
//! 默认实现返回 `UnsupportedOperation`。
//!
pub mod log;
mod factory;
mod memory;

pub use factory::build_adapter;
pub use memory::MemoryAdapter;

use crate::error::{RequestError, TransportError, UnsupportedOperation};
use crate::event::{Ack, Envelope};
use async_trait::async_trait;
use std::{fmt, time::Duration};

/// 适配器变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Memory,
    StreamLog,
    PartitionedLog,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::StreamLog => "stream-log",
            Self::PartitionedLog => "partitioned-log",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话内投递的不透明引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 一次投递
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub tag: DeliveryTag,
    /// 有序通道：同一 lane 的投递必须按序处理（内存 / 流式为 key，分区日志为分区）
    pub lane: Option<String>,
}

/// 应答的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Delivered,
    /// 请求方已超时或不存在，应答被丢弃
    Discarded,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    async fn publish(&self, envelope: Envelope) -> Result<Ack, TransportError>;

    /// 同 `group` 的多个会话构成消费组（竞争消费）；`None` 表示独立的全量订阅
    async fn open_subscription(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn SubscriptionSession>, TransportError>;

    async fn request(
        &self,
        _envelope: Envelope,
        _timeout: Duration,
    ) -> Result<Envelope, RequestError> {
        Err(UnsupportedOperation {
            adapter: self.kind().as_str(),
            operation: "request",
        }
        .into())
    }

    async fn reply(
        &self,
        _correlation_id: &str,
        _envelope: Envelope,
    ) -> Result<ReplyOutcome, RequestError> {
        Err(UnsupportedOperation {
            adapter: self.kind().as_str(),
            operation: "reply",
        }
        .into())
    }

    async fn close(&self) -> Result<(), TransportError>;
}

/// 订阅会话：仅由一个消费运行时独占持有
#[async_trait]
pub trait SubscriptionSession: Send {
    /// 等待下一条投递，`Ok(None)` 表示会话已结束。
    ///
    /// 必须是取消安全的：未完成的 `recv` 被丢弃时不得丢失消息。
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// 非阻塞：只返回已就绪的投递
    fn poll(&mut self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// 放弃处理，交还适配器择机重投
    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// 可并行处理的有序通道数（分区日志为分配到的分区数），`None` 表示不限
    fn lane_capacity(&self) -> Option<usize> {
        None
    }

    /// 会话允许的未确认投递上限
    fn prefetch(&self) -> Option<usize> {
        None
    }

    /// 续约周期：broker 会把长时间未确认的投递转交他人时返回 `Some`
    fn keepalive_interval(&self) -> Option<Duration> {
        None
    }

    /// 声明仍持有全部未确认投递（处理中、本地重试中、已缓冲）
    async fn keep_alive(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// 提交稳定位点并退出消费组
    async fn close(&mut self) -> Result<(), TransportError>;
}
