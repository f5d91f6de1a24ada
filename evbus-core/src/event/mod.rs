//! 事件模型（event）
//!
//! 定义在总线上流动的不可变值对象 `Event`、其线上形态 `Envelope`，
//! 以及发布成功后由适配器返回的确认 `Ack`。
//!
//! `Event` 的 `id` 与 `timestamp` 在构造时赋值且此后不再改变；跨队列边界时
//! 始终按值复制，而不是共享引用后原地修改。

mod ack;
mod envelope;
mod event_value;

pub use ack::{Ack, AckReceipt};
pub use envelope::Envelope;
pub use event_value::Event;

/// 死信条目携带的原始主题头
pub const HEADER_DLQ_ORIGINAL_TOPIC: &str = "x-evbus-dlq-original-topic";

/// 死信重放计数头
pub const HEADER_REPLAY_COUNT: &str = "x-evbus-replay-count";
