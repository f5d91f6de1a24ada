//! 消费端（consumer）
//!
//! 订阅方通过 `ConsumerOptions` 描述重试 / 死信 / 并发策略，以 `EventHandler`
//! 处理事件，并经由 `SubscriptionHandle` 观察和结束订阅。
//!
mod handle;
mod handler;
mod lanes;
mod options;
pub(crate) mod runtime;
mod state;

pub use handle::SubscriptionHandle;
pub use handler::{EventHandler, handler_fn};
pub use options::ConsumerOptions;
pub use state::{DeliveryState, SubscriptionState};
