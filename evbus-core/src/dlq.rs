//! 死信（DLQ）
//!
//! - `DlqEntry`：包裹终态失败的事件，原事件完整保留；
//! - `DlqHandler` + `EventBus::subscribe_dlq`：订阅死信主题并直接拿到解码后的条目；
//! - `DlqReplay`：冷却后把原事件重新发布到原主题，累计尝试次数受应用级上限约束，
//!   与原订阅的 `max_retries` 无关。
//!
use crate::bus::EventBus;
use crate::consumer::EventHandler;
use crate::error::{DecodeError, PublishError};
use crate::event::{Event, HEADER_DLQ_ORIGINAL_TOPIC, HEADER_REPLAY_COUNT};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// 累计尝试次数头（跨多轮重放）
pub const HEADER_TOTAL_ATTEMPTS: &str = "x-evbus-total-attempts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub original_topic: String,
    pub original_event: Event,
    /// 最后一次失败的描述
    pub error: String,
    /// 已进行的尝试次数
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(original_event: Event, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            original_topic: original_event.topic().to_string(),
            original_event,
            error: error.into(),
            retry_count,
            failed_at: Utc::now(),
        }
    }

    /// 包装为发往死信主题的事件（沿用原事件的 key 与租户）
    pub fn into_event(self, dlq_topic: &str) -> Result<Event, serde_json::Error> {
        let key = self.original_event.key().map(str::to_string);
        let tenant_id = self.original_event.tenant_id().map(str::to_string);
        let original_topic = self.original_topic.clone();
        let payload = serde_json::to_value(&self)?;
        Ok(Event::builder()
            .topic(dlq_topic)
            .payload(payload)
            .maybe_key(key)
            .maybe_tenant_id(tenant_id)
            .build()
            .with_header(HEADER_DLQ_ORIGINAL_TOPIC, original_topic))
    }

    pub fn from_event(event: &Event) -> Result<Self, DecodeError> {
        serde_json::from_value(event.payload().clone()).map_err(|err| {
            DecodeError::InvalidDlqEntry {
                reason: format!("event_id={}, {err}", event.id()),
            }
        })
    }

    /// 原事件此前累计的尝试次数（含本轮）
    pub fn total_attempts(&self) -> u32 {
        let previous = self
            .original_event
            .header(HEADER_TOTAL_ATTEMPTS)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        previous.saturating_add(self.retry_count)
    }

    pub fn replay_count(&self) -> u32 {
        self.original_event
            .header(HEADER_REPLAY_COUNT)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    }
}

/// 死信处理器
#[async_trait]
pub trait DlqHandler: Send + Sync {
    fn handler_name(&self) -> &str {
        "dlq"
    }

    /// `event` 为承载该条目的死信事件本身
    async fn handle_entry(&self, entry: DlqEntry, event: &Event) -> anyhow::Result<()>;
}

/// 把 `DlqHandler` 适配为普通处理器
pub(crate) struct DlqHandlerAdapter {
    inner: Arc<dyn DlqHandler>,
}

impl DlqHandlerAdapter {
    pub(crate) fn new(inner: Arc<dyn DlqHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventHandler for DlqHandlerAdapter {
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match DlqEntry::from_event(event) {
            Ok(entry) => self.inner.handle_entry(entry, event).await,
            Err(err) => {
                // 无法解析的条目重试也无济于事
                warn!(topic = %event.topic(), event_id = %event.id(), error = %err, "skipping malformed dead letter entry");
                Ok(())
            }
        }
    }
}

/// 重放结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Replayed { replay: u32, total_attempts: u32 },
    /// 累计尝试已达上限，不再重放
    Exhausted { total_attempts: u32 },
}

/// 冷却后重放到原主题
#[derive(Clone, Builder)]
pub struct DlqReplay {
    bus: EventBus,
    #[builder(default = Duration::ZERO)]
    cooldown: Duration,
    #[builder(default = 10)]
    max_total_attempts: u32,
}

impl DlqReplay {
    pub async fn replay(&self, entry: &DlqEntry) -> Result<ReplayOutcome, PublishError> {
        let total_attempts = entry.total_attempts();
        if total_attempts >= self.max_total_attempts {
            warn!(
                topic = %entry.original_topic,
                event_id = %entry.original_event.id(),
                total_attempts,
                "replay budget exhausted"
            );
            return Ok(ReplayOutcome::Exhausted { total_attempts });
        }

        if !self.cooldown.is_zero() {
            tokio::time::sleep(self.cooldown).await;
        }

        let replay = entry.replay_count() + 1;
        let event = entry
            .original_event
            .clone()
            .with_header(HEADER_REPLAY_COUNT, replay.to_string())
            .with_header(HEADER_TOTAL_ATTEMPTS, total_attempts.to_string());
        self.bus.publish(&event).await?;
        info!(
            topic = %entry.original_topic,
            event_id = %event.id(),
            replay,
            total_attempts,
            "dead letter replayed"
        );
        Ok(ReplayOutcome::Replayed {
            replay,
            total_attempts,
        })
    }
}

#[async_trait]
impl DlqHandler for DlqReplay {
    fn handler_name(&self) -> &str {
        "dlq-replay"
    }

    async fn handle_entry(&self, entry: DlqEntry, _event: &Event) -> anyhow::Result<()> {
        self.replay(&entry).await?;
        Ok(())
    }
}
