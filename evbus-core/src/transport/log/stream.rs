//! 流式日志适配器
//!
//! 每个主题对应一条流，`group` 映射为流的消费组：
//! - `ack` 从组的待确认列表中移除条目；
//! - `nack` 不做任何 broker 调用，条目留在待确认列表中，会话关闭时交还给组，
//!   或闲置超过 `consumer_timeout_ms` 后被组内消费者（包括自己）重新认领；
//! - 会话仍持有的条目（处理中、本地重试中、已缓冲）按 `consumer_timeout_ms / 3`
//!   周期续约，不会被当作闲置条目认领；
//! - 会话的未确认条目不超过 `prefetch`。
//!
use super::{StreamEntry, StreamId, StreamLog};
use crate::config::{ReconnectPolicy, StreamLogConfig};
use crate::error::{ConfigError, TransportError};
use crate::event::{Ack, AckReceipt, Envelope};
use crate::transport::{
    AdapterKind, Delivery, DeliveryTag, SubscriptionSession, TransportAdapter,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct StreamLogAdapter {
    log: Arc<dyn StreamLog>,
    config: StreamLogConfig,
}

impl StreamLogAdapter {
    pub fn new(log: Arc<dyn StreamLog>, config: StreamLogConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { log, config })
    }

    pub fn config(&self) -> &StreamLogConfig {
        &self.config
    }
}

#[async_trait]
impl TransportAdapter for StreamLogAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::StreamLog
    }

    async fn publish(&self, envelope: Envelope) -> Result<Ack, TransportError> {
        let topic = envelope.topic.clone();
        let event_id = envelope.id.clone();
        let max_len = self.config.max_stream_length;
        let id = self
            .config
            .reconnect
            .run("append", TransportError::is_retryable, || {
                self.log.append(&topic, envelope.clone(), max_len)
            })
            .await?;
        debug!(topic = %topic, event_id = %event_id, stream_id = %id, "stream log publish");
        Ok(Ack {
            event_id,
            topic,
            receipt: AckReceipt::Stream { id: id.to_string() },
        })
    }

    async fn open_subscription(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn SubscriptionSession>, TransportError> {
        let (group, ephemeral) = match group {
            Some(group) => (group.to_string(), false),
            None => (format!("~{}", Uuid::new_v4()), true),
        };
        let consumer = Uuid::new_v4().to_string();
        let start = self.config.start_from;

        self.config
            .reconnect
            .run("create_group", TransportError::is_retryable, || {
                self.log.create_group(topic, &group, start)
            })
            .await?;
        info!(topic, group = %group, consumer = %consumer, "stream log subscription opened");

        Ok(Box::new(StreamSession {
            log: self.log.clone(),
            config: self.config.clone(),
            topic: topic.to_string(),
            group,
            consumer,
            ephemeral,
            buffer: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct StreamSession {
    log: Arc<dyn StreamLog>,
    config: StreamLogConfig,
    topic: String,
    group: String,
    consumer: String,
    ephemeral: bool,
    buffer: VecDeque<StreamEntry>,
    unacked: HashMap<DeliveryTag, StreamId>,
    next_tag: u64,
    closed: bool,
}

impl StreamSession {
    fn reconnect(&self) -> ReconnectPolicy {
        self.config.reconnect
    }

    /// 未确认（含已缓冲）条目之外的剩余额度
    fn room(&self) -> usize {
        self.config
            .prefetch
            .saturating_sub(self.unacked.len() + self.buffer.len())
    }

    /// 本会话仍持有的条目：已投递未确认的与已缓冲的
    fn held_ids(&self) -> Vec<StreamId> {
        self.unacked
            .values()
            .copied()
            .chain(self.buffer.iter().map(|entry| entry.id))
            .collect()
    }

    async fn fill_buffer(&mut self) -> Result<(), TransportError> {
        let room = self.room();
        if room == 0 {
            return Ok(());
        }
        let log = self.log.clone();
        let reconnect = self.reconnect();
        let min_idle = Duration::from_millis(self.config.consumer_timeout_ms);

        let claimed = reconnect
            .run("claim_idle", TransportError::is_retryable, || {
                log.claim_idle(&self.topic, &self.group, &self.consumer, min_idle, room)
            })
            .await?;
        // 续约赶不上时也可能认领回自己正在处理的条目，不能再投递一次
        let held: HashSet<StreamId> = self.held_ids().into_iter().collect();
        let claimed: Vec<StreamEntry> = claimed
            .into_iter()
            .filter(|entry| !held.contains(&entry.id))
            .collect();
        if !claimed.is_empty() {
            debug!(
                topic = %self.topic,
                group = %self.group,
                count = claimed.len(),
                "claimed idle pending entries"
            );
            self.buffer.extend(claimed);
            return Ok(());
        }

        let fresh = reconnect
            .run("read_group", TransportError::is_retryable, || {
                log.read_group(&self.topic, &self.group, &self.consumer, room)
            })
            .await?;
        self.buffer.extend(fresh);
        Ok(())
    }

    fn deliver(&mut self, entry: StreamEntry) -> Delivery {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.unacked.insert(tag, entry.id);
        Delivery {
            lane: entry.envelope.key.clone(),
            envelope: entry.envelope,
            tag,
        }
    }
}

#[async_trait]
impl SubscriptionSession for StreamSession {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(self.deliver(entry)));
            }
            self.fill_buffer().await?;
            if self.buffer.is_empty() {
                self.log
                    .wait_for_data(&self.topic, Duration::from_millis(self.config.fetch_wait_ms))
                    .await;
            }
        }
    }

    fn poll(&mut self) -> Result<Option<Delivery>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.buffer.pop_front().map(|entry| self.deliver(entry)))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        let Some(id) = self.unacked.remove(&tag) else {
            return Ok(());
        };
        let log = self.log.clone();
        let still_pending = self
            .reconnect()
            .run("ack", TransportError::is_retryable, || {
                log.ack(&self.topic, &self.group, id)
            })
            .await?;
        if !still_pending {
            debug!(topic = %self.topic, stream_id = %id, "entry was claimed elsewhere before ack");
        }
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.unacked.remove(&tag);
        Ok(())
    }

    fn prefetch(&self) -> Option<usize> {
        Some(self.config.prefetch)
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        let period = Duration::from_millis(self.config.consumer_timeout_ms / 3);
        Some(period.max(Duration::from_millis(1)))
    }

    async fn keep_alive(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let ids = self.held_ids();
        if ids.is_empty() {
            return Ok(());
        }
        let log = self.log.clone();
        let touched = self
            .reconnect()
            .run("touch", TransportError::is_retryable, || {
                log.touch(&self.topic, &self.group, &self.consumer, &ids)
            })
            .await?;
        if touched < ids.len() {
            debug!(
                topic = %self.topic,
                group = %self.group,
                held = ids.len(),
                touched,
                "some held entries were claimed by another consumer"
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        self.unacked.clear();

        let log = self.log.clone();
        let reconnect = self.reconnect();
        if self.ephemeral {
            reconnect
                .run("destroy_group", TransportError::is_retryable, || {
                    log.destroy_group(&self.topic, &self.group)
                })
                .await?;
        } else if let Err(err) = reconnect
            .run("release_consumer", TransportError::is_retryable, || {
                log.release_consumer(&self.topic, &self.group, &self.consumer)
            })
            .await
        {
            warn!(topic = %self.topic, group = %self.group, error = %err, "release failed, entries wait for idle claim");
            return Err(err);
        }
        debug!(topic = %self.topic, group = %self.group, "stream log subscription closed");
        Ok(())
    }
}
