//! 日志型适配器（log）
//!
//! 两类持久化、支持消费组的后端，各自通过一个最小的 broker 客户端接口接入：
//! - `PartitionedLog`：分区 + 偏移量（消费组提交偏移）；
//! - `StreamLog`：单一流 + 条目 id（消费组维护待确认列表）。
//!
//! 接口只包含发布与消费所需的操作，不涉及集群运维。`InProcess*` 为进程内参考实现。
//!
mod partitioned;
mod partitioned_inprocess;
mod stream;
mod stream_inprocess;

pub use partitioned::PartitionedLogAdapter;
pub use partitioned_inprocess::InProcessPartitionedLog;
pub use stream::StreamLogAdapter;
pub use stream_inprocess::InProcessStreamLog;

use crate::config::OffsetReset;
use crate::error::TransportError;
use crate::event::Envelope;
use async_trait::async_trait;
use std::{fmt, str::FromStr, time::Duration};

// --- 分区日志 ---

/// 分区内的一条记录
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub offset: u64,
    pub envelope: Envelope,
}

/// 消费组成员在某一代（generation）中分到的分区
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupAssignment {
    pub generation: u64,
    pub partitions: Vec<u32>,
}

#[async_trait]
pub trait PartitionedLog: Send + Sync {
    /// 主题不存在时按 broker 默认分区数创建
    async fn partition_count(&self, topic: &str) -> Result<u32, TransportError>;

    async fn append(
        &self,
        topic: &str,
        partition: u32,
        envelope: Envelope,
    ) -> Result<u64, TransportError>;

    /// 从 `from_offset` 起读取至多 `max` 条；起点早于保留窗口时从最早记录开始
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, TransportError>;

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError>;

    /// 下一条将写入的偏移量
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError>;

    /// 提交“下一条待读”的偏移量
    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), TransportError>;

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, TransportError>;

    async fn join_group(
        &self,
        group: &str,
        topic: &str,
        member: &str,
    ) -> Result<GroupAssignment, TransportError>;

    async fn assignment(
        &self,
        group: &str,
        topic: &str,
        member: &str,
    ) -> Result<GroupAssignment, TransportError>;

    async fn leave_group(&self, group: &str, topic: &str, member: &str)
    -> Result<(), TransportError>;

    /// 等待主题出现新数据，最多 `timeout`
    async fn wait_for_data(&self, topic: &str, timeout: Duration);
}

/// 32 位 FNV-1a，分区键哈希
pub fn fnv1a(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

/// 按键选择分区，相同键恒落在同一分区
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    fnv1a(key) % partitions.max(1)
}

// --- 流式日志 ---

/// 流条目 id：`<毫秒时间戳>-<序号>`，单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// 在 `last` 之后生成新 id（时钟回拨时沿用 `last.ms` 递增序号）
    pub fn next_after(last: StreamId, now_ms: u64) -> StreamId {
        if now_ms > last.ms {
            StreamId { ms: now_ms, seq: 0 }
        } else {
            StreamId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::broker(format!("invalid stream id: {s}"));
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(StreamId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub envelope: Envelope,
    /// 被投递的次数（认领会递增）
    pub delivery_count: u32,
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// 追加条目；`max_len` 给出时裁剪最旧条目
    async fn append(
        &self,
        stream: &str,
        envelope: Envelope,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError>;

    /// 幂等创建消费组
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: OffsetReset,
    ) -> Result<(), TransportError>;

    /// 读取组内尚未投递过的新条目，并记入该消费者的待确认列表
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// 认领闲置超过 `min_idle` 的待确认条目
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// 重置该消费者仍持有条目的闲置计时，返回实际续约的条数
    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError>;

    /// 返回条目是否仍在待确认列表中
    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError>;

    /// 把消费者名下的待确认条目立即交还给组
    async fn release_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<(), TransportError>;

    /// 删除消费组（私有组退出时使用）
    async fn destroy_group(&self, stream: &str, group: &str) -> Result<(), TransportError>;

    async fn wait_for_data(&self, stream: &str, timeout: Duration);
}
