use serde::{Deserialize, Serialize};

/// 发布确认：事件已被适配器接收
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub event_id: String,
    pub topic: String,
    pub receipt: AckReceipt,
}

/// 各适配器的落点描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AckReceipt {
    /// 内存队列：投递到的队列数量（无订阅者时进入积压队列，计为 0）
    Memory { queued: usize },
    /// 流式日志：流内条目 id（`ms-seq`）
    Stream { id: String },
    /// 分区日志：分区与偏移量
    Partition { partition: u32, offset: u64 },
}
