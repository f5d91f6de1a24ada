use super::{StreamEntry, StreamId, StreamLog};
use crate::config::OffsetReset;
use crate::error::TransportError;
use crate::event::Envelope;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

struct PendingEntry {
    consumer: String,
    /// `None` 表示已被交还，可立即认领
    delivered_at: Option<Instant>,
    delivery_count: u32,
}

struct ConsumerGroup {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<StreamId, Envelope>,
    last_id: StreamId,
    groups: HashMap<String, ConsumerGroup>,
}

/// 进程内流式日志 broker（消费组 + 待确认列表 + 闲置认领）
pub struct InProcessStreamLog {
    streams: Mutex<HashMap<String, Stream>>,
    notifiers: DashMap<String, Arc<Notify>>,
    available: AtomicBool,
}

impl Default for InProcessStreamLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessStreamLog {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notifiers: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::unavailable("stream log broker unreachable"))
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        self.notifiers
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn no_group(stream: &str, group: &str) -> TransportError {
        TransportError::broker(format!("no such consumer group: stream={stream}, group={group}"))
    }
}

#[async_trait]
impl StreamLog for InProcessStreamLog {
    async fn append(
        &self,
        stream: &str,
        envelope: Envelope,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError> {
        self.check()?;
        let id = {
            let mut streams = self.lock();
            let s = streams.entry(stream.to_string()).or_default();
            let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
            let id = StreamId::next_after(s.last_id, now_ms);
            s.last_id = id;
            s.entries.insert(id, envelope);
            if let Some(limit) = max_len {
                while s.entries.len() > limit {
                    s.entries.pop_first();
                }
            }
            id
        };
        self.notifier(stream).notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: OffsetReset,
    ) -> Result<(), TransportError> {
        self.check()?;
        let mut streams = self.lock();
        let s = streams.entry(stream.to_string()).or_default();
        let last_delivered = match start {
            OffsetReset::Earliest => StreamId::ZERO,
            OffsetReset::Latest => s.last_id,
        };
        s.groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroup {
                last_delivered,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        self.check()?;
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = s;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        let fresh: Vec<(StreamId, Envelope)> = entries
            .range((
                std::ops::Bound::Excluded(g.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
            .map(|(id, envelope)| (*id, envelope.clone()))
            .collect();

        let now = Instant::now();
        Ok(fresh
            .into_iter()
            .map(|(id, envelope)| {
                g.last_delivered = id;
                g.pending.insert(
                    id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: Some(now),
                        delivery_count: 1,
                    },
                );
                StreamEntry {
                    id,
                    envelope,
                    delivery_count: 1,
                }
            })
            .collect())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        self.check()?;
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = s;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        // 已被裁剪的条目无法再投递，直接移出待确认列表
        g.pending.retain(|id, _| entries.contains_key(id));

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, pending) in g.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            let idle_enough = match pending.delivered_at {
                None => true,
                Some(at) => now.duration_since(at) >= min_idle,
            };
            if !idle_enough {
                continue;
            }
            let Some(envelope) = entries.get(id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = Some(now);
            pending.delivery_count += 1;
            claimed.push(StreamEntry {
                id: *id,
                envelope: envelope.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError> {
        self.check()?;
        let mut streams = self.lock();
        let Some(g) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let now = Instant::now();
        let mut touched = 0;
        for id in ids {
            // 已被他人认领或已交还的条目不再属于该消费者
            if let Some(pending) = g.pending.get_mut(id) {
                if pending.consumer == consumer && pending.delivered_at.is_some() {
                    pending.delivered_at = Some(now);
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError> {
        self.check()?;
        let mut streams = self.lock();
        Ok(streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn release_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        {
            let mut streams = self.lock();
            if let Some(g) = streams
                .get_mut(stream)
                .and_then(|s| s.groups.get_mut(group))
            {
                for pending in g.pending.values_mut().filter(|p| p.consumer == consumer) {
                    pending.delivered_at = None;
                }
            }
        }
        self.notifier(stream).notify_waiters();
        Ok(())
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<(), TransportError> {
        self.check()?;
        if let Some(s) = self.lock().get_mut(stream) {
            s.groups.remove(group);
        }
        Ok(())
    }

    async fn wait_for_data(&self, stream: &str, timeout: Duration) {
        let notify = self.notifier(stream);
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
    }
}
