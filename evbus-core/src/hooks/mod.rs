//! 可观测性钩子（hooks）
//!
//! 能力分型的回调接口，按注册顺序调用：
//! - `PublishHook`：发布前 / 发布后；
//! - `ConsumeHook`：接收、处理结果、重试排期、死信路由；
//! - `LifecycleHook`：订阅失败（致命）、迟到应答、事件丢弃。
//!
//! 钩子是尽力而为的：单个回调 panic 会被捕获并记录，既不影响其他回调，
//! 也不会中断被观测的操作。
//!
mod logging;
mod metrics;

pub use logging::LoggingHook;
pub use metrics::{BusMetrics, MetricsSnapshot};

use crate::event::Event;
use bon::Builder;
use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};
use tracing::warn;

/// 被观测的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    Consume,
    Retry,
    DeadLetter,
    Drop,
    LateReply,
    SubscriptionFailed,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Consume => "consume",
            Self::Retry => "retry",
            Self::DeadLetter => "dead_letter",
            Self::Drop => "drop",
            Self::LateReply => "late_reply",
            Self::SubscriptionFailed => "subscription_failed",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传给观测后端的结构化记录
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct HookRecord {
    pub operation: Operation,
    #[builder(into)]
    pub topic: String,
    #[builder(into)]
    pub event_id: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
    #[builder(default)]
    pub duration: Duration,
    #[builder(default = true)]
    pub success: bool,
    pub retry_count: Option<u32>,
    #[builder(into)]
    pub error: Option<String>,
}

impl HookRecord {
    /// 需要外部告警的记录
    pub fn is_fatal(&self) -> bool {
        self.operation == Operation::SubscriptionFailed
    }
}

pub trait PublishHook: Send + Sync {
    fn before_publish(&self, _event: &Event) {}

    fn after_publish(&self, _record: &HookRecord) {}
}

pub trait ConsumeHook: Send + Sync {
    /// `attempt` 从 1 开始
    fn on_receive(&self, _event: &Event, _attempt: u32) {}

    fn after_consume(&self, _record: &HookRecord) {}

    fn on_retry_scheduled(&self, _record: &HookRecord, _delay: Duration) {}

    /// `record.success == false` 表示死信发布本身失败
    fn on_dead_letter(&self, _record: &HookRecord) {}
}

pub trait LifecycleHook: Send + Sync {
    fn on_subscription_failed(&self, _record: &HookRecord) {}

    fn on_late_reply(&self, _record: &HookRecord) {}

    fn on_event_dropped(&self, _record: &HookRecord) {}
}

/// 钩子注册表，克隆开销为若干 `Arc`
#[derive(Clone, Default)]
pub struct Hooks {
    publish: Vec<Arc<dyn PublishHook>>,
    consume: Vec<Arc<dyn ConsumeHook>>,
    lifecycle: Vec<Arc<dyn LifecycleHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("publish", &self.publish.len())
            .field("consume", &self.consume.len())
            .field("lifecycle", &self.lifecycle.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publish(mut self, hook: Arc<dyn PublishHook>) -> Self {
        self.publish.push(hook);
        self
    }

    pub fn with_consume(mut self, hook: Arc<dyn ConsumeHook>) -> Self {
        self.consume.push(hook);
        self
    }

    pub fn with_lifecycle(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.lifecycle.push(hook);
        self
    }

    /// 同时实现三种能力的钩子（如 `BusMetrics`、`LoggingHook`）一次注册
    pub fn with_all<H>(self, hook: Arc<H>) -> Self
    where
        H: PublishHook + ConsumeHook + LifecycleHook + 'static,
    {
        self.with_publish(hook.clone())
            .with_consume(hook.clone())
            .with_lifecycle(hook)
    }

    pub fn is_empty(&self) -> bool {
        self.publish.is_empty() && self.consume.is_empty() && self.lifecycle.is_empty()
    }

    pub(crate) fn before_publish(&self, event: &Event) {
        for hook in &self.publish {
            isolate("before_publish", || hook.before_publish(event));
        }
    }

    pub(crate) fn after_publish(&self, record: &HookRecord) {
        for hook in &self.publish {
            isolate("after_publish", || hook.after_publish(record));
        }
    }

    pub(crate) fn on_receive(&self, event: &Event, attempt: u32) {
        for hook in &self.consume {
            isolate("on_receive", || hook.on_receive(event, attempt));
        }
    }

    pub(crate) fn after_consume(&self, record: &HookRecord) {
        for hook in &self.consume {
            isolate("after_consume", || hook.after_consume(record));
        }
    }

    pub(crate) fn on_retry_scheduled(&self, record: &HookRecord, delay: Duration) {
        for hook in &self.consume {
            isolate("on_retry_scheduled", || hook.on_retry_scheduled(record, delay));
        }
    }

    pub(crate) fn on_dead_letter(&self, record: &HookRecord) {
        for hook in &self.consume {
            isolate("on_dead_letter", || hook.on_dead_letter(record));
        }
    }

    pub(crate) fn on_subscription_failed(&self, record: &HookRecord) {
        for hook in &self.lifecycle {
            isolate("on_subscription_failed", || hook.on_subscription_failed(record));
        }
    }

    pub(crate) fn on_late_reply(&self, record: &HookRecord) {
        for hook in &self.lifecycle {
            isolate("on_late_reply", || hook.on_late_reply(record));
        }
    }

    pub(crate) fn on_event_dropped(&self, record: &HookRecord) {
        for hook in &self.lifecycle {
            isolate("on_event_dropped", || hook.on_event_dropped(record));
        }
    }
}

fn isolate(callback: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            callback,
            reason = %panic_message(payload.as_ref()),
            "observability hook panicked, ignored"
        );
    }
}

/// 提取 panic 载荷中的文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Exploding;

    impl PublishHook for Exploding {
        fn before_publish(&self, _event: &Event) {
            panic!("boom");
        }
    }

    impl LifecycleHook for Exploding {
        fn on_event_dropped(&self, _record: &HookRecord) {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl PublishHook for Recorder {
        fn before_publish(&self, event: &Event) {
            self.seen.lock().unwrap().push(format!("before:{}", event.topic()));
        }

        fn after_publish(&self, record: &HookRecord) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("after:{}:{}", record.topic, record.success));
        }
    }

    impl LifecycleHook for Recorder {
        fn on_event_dropped(&self, record: &HookRecord) {
            self.seen.lock().unwrap().push(format!("dropped:{}", record.topic));
        }
    }

    #[test]
    fn panicking_hook_does_not_stop_later_hooks() {
        let recorder = Arc::new(Recorder::default());
        let hooks = Hooks::new()
            .with_publish(Arc::new(Exploding))
            .with_publish(recorder.clone())
            .with_lifecycle(Arc::new(Exploding))
            .with_lifecycle(recorder.clone());

        let event = Event::new("order.created", json!({}));
        hooks.before_publish(&event);
        hooks.after_publish(
            &HookRecord::builder()
                .operation(Operation::Publish)
                .topic("order.created")
                .build(),
        );
        hooks.on_event_dropped(
            &HookRecord::builder()
                .operation(Operation::Drop)
                .topic("order.created")
                .success(false)
                .build(),
        );

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                "before:order.created".to_string(),
                "after:order.created:true".to_string(),
                "dropped:order.created".to_string(),
            ]
        );
    }

    #[test]
    fn record_defaults() {
        let record = HookRecord::builder()
            .operation(Operation::SubscriptionFailed)
            .topic("t")
            .build();
        assert!(record.success);
        assert_eq!(record.duration, Duration::ZERO);
        assert!(record.is_fatal());
        assert_eq!(Operation::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn panic_message_variants() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
