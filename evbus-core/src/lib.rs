//! 传输无关的事件总线（evbus-core）
//!
//! 应用只依赖 `EventBus` 门面，底层传输可在内存队列、分区日志、流日志之间切换：
//! - 事件模型（`event`）与编解码（`codec`）
//! - 传输适配器（`transport`）：统一的发布 / 订阅会话契约
//! - 消费运行时（`consumer`）：有界并发、按键有序、退避重试、死信路由、优雅排空
//! - 死信工具（`dlq`）：`DlqEntry` 解析与带冷却的重放
//! - 可观测性钩子（`hooks`）：发布 / 消费 / 生命周期回调，附带日志与计数实现
//! - 配置（`config`）：启动时一次性校验
//!
//! 典型用法：
//! 1. 通过 `EventBus::builder()` 或 `EventBus::from_settings` 构造总线；
//! 2. `subscribe` 注册处理器，拿到 `SubscriptionHandle` 控制其生命周期；
//! 3. `publish` 发布事件；
//! 4. 退出前 `close`，等待所有订阅排空。
//!
pub mod backoff;
pub mod bus;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod event;
pub mod hooks;
pub mod transport;

pub use bus::EventBus;
pub use consumer::{ConsumerOptions, EventHandler, SubscriptionHandle, SubscriptionState, handler_fn};
pub use dlq::{DlqEntry, DlqHandler, DlqReplay};
pub use error::{BusError, BusResult};
pub use event::{Ack, Event};
