use crate::event::Event;
use async_trait::async_trait;
use std::{future::Future, sync::Arc};

/// 事件处理器
///
/// 必须对至少一次投递保持幂等：重试会原样重放同一事件（相同 `id`）。
/// 返回错误或 panic 都视为一次失败，由消费运行时决定重试还是进入死信。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与失败记录）
    fn handler_name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// 以闭包构造处理器
///
/// ```
/// use evbus_core::consumer::{EventHandler, handler_fn};
///
/// let handler = handler_fn("audit", |event| async move {
///     println!("{}", event.topic());
///     Ok(())
/// });
/// assert_eq!(handler.handler_name(), "audit");
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
