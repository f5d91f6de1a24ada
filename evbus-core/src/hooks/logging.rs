use super::{ConsumeHook, HookRecord, LifecycleHook, PublishHook};
use std::time::Duration;
use tracing::{debug, error, warn};

/// 将钩子记录镜像到 `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

fn emit(record: &HookRecord) {
    debug!(
        operation = %record.operation,
        topic = %record.topic,
        event_id = record.event_id.as_deref().unwrap_or("-"),
        group = record.group.as_deref().unwrap_or("-"),
        duration_ms = record.duration.as_millis() as u64,
        success = record.success,
        retry_count = record.retry_count.unwrap_or(0),
        error = record.error.as_deref().unwrap_or(""),
        "evbus hook"
    );
}

impl PublishHook for LoggingHook {
    fn after_publish(&self, record: &HookRecord) {
        emit(record);
    }
}

impl ConsumeHook for LoggingHook {
    fn after_consume(&self, record: &HookRecord) {
        emit(record);
    }

    fn on_retry_scheduled(&self, record: &HookRecord, delay: Duration) {
        debug!(
            topic = %record.topic,
            event_id = record.event_id.as_deref().unwrap_or("-"),
            retry_count = record.retry_count.unwrap_or(0),
            delay_ms = delay.as_millis() as u64,
            "evbus retry scheduled"
        );
    }

    fn on_dead_letter(&self, record: &HookRecord) {
        emit(record);
    }
}

impl LifecycleHook for LoggingHook {
    fn on_subscription_failed(&self, record: &HookRecord) {
        error!(
            topic = %record.topic,
            group = record.group.as_deref().unwrap_or("-"),
            error = record.error.as_deref().unwrap_or(""),
            "evbus subscription failed"
        );
    }

    fn on_late_reply(&self, record: &HookRecord) {
        emit(record);
    }

    fn on_event_dropped(&self, record: &HookRecord) {
        warn!(
            topic = %record.topic,
            event_id = record.event_id.as_deref().unwrap_or("-"),
            error = record.error.as_deref().unwrap_or(""),
            "evbus event dropped"
        );
    }
}
