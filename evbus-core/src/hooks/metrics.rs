use super::{ConsumeHook, HookRecord, LifecycleHook, PublishHook};
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// 基于原子计数的内置指标钩子
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    publish_failures: AtomicU64,
    consumed: AtomicU64,
    consume_failures: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    dropped: AtomicU64,
    late_replies: AtomicU64,
    fatal: AtomicU64,
    publish_micros: AtomicU64,
    consume_micros: AtomicU64,
}

/// 某一时刻的指标快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub consumed: u64,
    pub consume_failures: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub dropped: u64,
    pub late_replies: u64,
    pub fatal: u64,
    pub publish_time: Duration,
    pub consume_time: Duration,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            published: load(&self.published),
            publish_failures: load(&self.publish_failures),
            consumed: load(&self.consumed),
            consume_failures: load(&self.consume_failures),
            retries: load(&self.retries),
            dead_lettered: load(&self.dead_lettered),
            dead_letter_failures: load(&self.dead_letter_failures),
            dropped: load(&self.dropped),
            late_replies: load(&self.late_replies),
            fatal: load(&self.fatal),
            publish_time: Duration::from_micros(load(&self.publish_micros)),
            consume_time: Duration::from_micros(load(&self.consume_micros)),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add_duration(counter: &AtomicU64, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        counter.fetch_add(micros, Ordering::Relaxed);
    }
}

impl PublishHook for BusMetrics {
    fn after_publish(&self, record: &HookRecord) {
        if record.success {
            Self::bump(&self.published);
        } else {
            Self::bump(&self.publish_failures);
        }
        Self::add_duration(&self.publish_micros, record.duration);
    }
}

impl ConsumeHook for BusMetrics {
    fn after_consume(&self, record: &HookRecord) {
        if record.success {
            Self::bump(&self.consumed);
        } else {
            Self::bump(&self.consume_failures);
        }
        Self::add_duration(&self.consume_micros, record.duration);
    }

    fn on_retry_scheduled(&self, _record: &HookRecord, _delay: Duration) {
        Self::bump(&self.retries);
    }

    fn on_dead_letter(&self, record: &HookRecord) {
        if record.success {
            Self::bump(&self.dead_lettered);
        } else {
            Self::bump(&self.dead_letter_failures);
        }
    }
}

impl LifecycleHook for BusMetrics {
    fn on_subscription_failed(&self, _record: &HookRecord) {
        Self::bump(&self.fatal);
    }

    fn on_late_reply(&self, _record: &HookRecord) {
        Self::bump(&self.late_replies);
    }

    fn on_event_dropped(&self, _record: &HookRecord) {
        Self::bump(&self.dropped);
    }
}
