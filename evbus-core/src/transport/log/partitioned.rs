//! 分区日志适配器
//!
//! - 有 `key` 的事件按 FNV-1a 哈希选分区，同键同分区即同序；无键事件轮询分区；
//! - `group` 映射为 broker 的消费组，未分组的订阅使用一次性的私有组；
//! - `ack` 推进该分区的“连续已确认”位点后提交，乱序确认不会越过未确认的记录；
//! - 每个分区最多 `max_in_flight` 条未确认记录，避免超量预取破坏至少一次语义。
//!
use super::{LogRecord, PartitionedLog, partition_for_key};
use crate::config::{OffsetReset, PartitionedLogConfig, ReconnectPolicy};
use crate::error::{ConfigError, TransportError};
use crate::event::{Ack, AckReceipt, Envelope};
use crate::transport::{
    AdapterKind, Delivery, DeliveryTag, SubscriptionSession, TransportAdapter,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info};
use uuid::Uuid;

pub struct PartitionedLogAdapter {
    log: Arc<dyn PartitionedLog>,
    config: PartitionedLogConfig,
    round_robin: AtomicU32,
}

impl PartitionedLogAdapter {
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        config: PartitionedLogConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            log,
            config,
            round_robin: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &PartitionedLogConfig {
        &self.config
    }
}

#[async_trait]
impl TransportAdapter for PartitionedLogAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::PartitionedLog
    }

    async fn publish(&self, envelope: Envelope) -> Result<Ack, TransportError> {
        let reconnect = self.config.reconnect;
        let topic = envelope.topic.clone();
        let event_id = envelope.id.clone();

        let count = reconnect
            .run("partition_count", TransportError::is_retryable, || {
                self.log.partition_count(&topic)
            })
            .await?;
        let partition = match envelope.key.as_deref() {
            Some(key) => partition_for_key(key, count),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count.max(1),
        };
        let offset = reconnect
            .run("append", TransportError::is_retryable, || {
                self.log.append(&topic, partition, envelope.clone())
            })
            .await?;

        debug!(topic = %topic, event_id = %event_id, partition, offset, "partitioned log publish");
        Ok(Ack {
            event_id,
            topic,
            receipt: AckReceipt::Partition { partition, offset },
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
        let member = Uuid::new_v4().to_string();
        let reconnect = self.config.reconnect;

        reconnect
            .run("join_group", TransportError::is_retryable, || {
                self.log.join_group(&group, topic, &member)
            })
            .await?;

        let mut session = PartitionedSession {
            log: self.log.clone(),
            config: self.config.clone(),
            topic: topic.to_string(),
            group,
            member,
            ephemeral,
            generation: 0,
            cursors: BTreeMap::new(),
            buffer: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 0,
            closed: false,
        };
        session.refresh_assignment().await?;
        info!(
            topic,
            group = %session.group,
            partitions = ?session.cursors.keys().collect::<Vec<_>>(),
            "partitioned log subscription opened"
        );
        Ok(Box::new(session))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Cursor {
    /// 下一条待拉取的偏移量
    position: u64,
    /// 已提交（下一条待读）的偏移量
    committed: u64,
    /// 已拉取但尚未确认的偏移量
    in_flight: BTreeSet<u64>,
}

impl Cursor {
    fn starting_at(offset: u64) -> Self {
        Self {
            position: offset,
            committed: offset,
            in_flight: BTreeSet::new(),
        }
    }

    /// 可安全提交的位点：最小的未确认偏移量，或全部确认时的拉取位置
    fn commit_point(&self) -> u64 {
        self.in_flight.first().copied().unwrap_or(self.position)
    }
}

struct Pending {
    partition: u32,
    offset: u64,
    envelope: Envelope,
}

struct PartitionedSession {
    log: Arc<dyn PartitionedLog>,
    config: PartitionedLogConfig,
    topic: String,
    group: String,
    member: String,
    ephemeral: bool,
    generation: u64,
    cursors: BTreeMap<u32, Cursor>,
    buffer: VecDeque<(u32, LogRecord)>,
    unacked: HashMap<DeliveryTag, Pending>,
    next_tag: u64,
    closed: bool,
}

impl PartitionedSession {
    fn reconnect(&self) -> ReconnectPolicy {
        self.config.reconnect
    }

    /// 跟随消费组的再平衡：先完成全部 broker 调用，最后一次性更新本地状态
    async fn refresh_assignment(&mut self) -> Result<(), TransportError> {
        let reconnect = self.reconnect();
        let log = self.log.clone();
        let assignment = reconnect
            .run("assignment", TransportError::is_retryable, || {
                log.assignment(&self.group, &self.topic, &self.member)
            })
            .await?;
        if assignment.generation == self.generation {
            return Ok(());
        }

        let owned: BTreeSet<u32> = assignment.partitions.iter().copied().collect();
        let revoked: Vec<u32> = self
            .cursors
            .keys()
            .filter(|p| !owned.contains(*p))
            .copied()
            .collect();
        for &partition in &revoked {
            if let Some(cursor) = self.cursors.get(&partition) {
                let point = cursor.commit_point();
                if point > cursor.committed {
                    reconnect
                        .run("commit", TransportError::is_retryable, || {
                            log.commit(&self.group, &self.topic, partition, point)
                        })
                        .await?;
                }
            }
        }

        let mut added = Vec::new();
        for &partition in owned.iter().filter(|p| !self.cursors.contains_key(*p)) {
            let committed = reconnect
                .run("committed", TransportError::is_retryable, || {
                    log.committed(&self.group, &self.topic, partition)
                })
                .await?;
            let start = match committed {
                Some(offset) => offset,
                None => {
                    reconnect
                        .run("reset_offset", TransportError::is_retryable, || async {
                            match self.config.offset_reset {
                                OffsetReset::Earliest => {
                                    log.earliest_offset(&self.topic, partition).await
                                }
                                OffsetReset::Latest => log.end_offset(&self.topic, partition).await,
                            }
                        })
                        .await?
                }
            };
            added.push((partition, start));
        }

        for partition in &revoked {
            self.cursors.remove(partition);
        }
        self.buffer.retain(|(p, _)| owned.contains(p));
        for (partition, start) in added {
            self.cursors.insert(partition, Cursor::starting_at(start));
        }
        if self.generation != 0 {
            info!(
                topic = %self.topic,
                group = %self.group,
                generation = assignment.generation,
                revoked = ?revoked,
                owned = ?owned,
                "partition assignment changed"
            );
        }
        self.generation = assignment.generation;
        Ok(())
    }

    /// 为每个未达上限的分区拉取一批记录
    async fn fill_buffer(&mut self) -> Result<(), TransportError> {
        let reconnect = self.reconnect();
        let log = self.log.clone();
        let partitions: Vec<u32> = self.cursors.keys().copied().collect();
        for partition in partitions {
            let Some(cursor) = self.cursors.get(&partition) else {
                continue;
            };
            let room = self.config.max_in_flight.saturating_sub(cursor.in_flight.len());
            if room == 0 {
                continue;
            }
            let from = cursor.position;
            let records = reconnect
                .run("fetch", TransportError::is_retryable, || {
                    log.fetch(&self.topic, partition, from, room)
                })
                .await?;
            let Some(cursor) = self.cursors.get_mut(&partition) else {
                continue;
            };
            for record in records {
                cursor.in_flight.insert(record.offset);
                cursor.position = record.offset + 1;
                self.buffer.push_back((partition, record));
            }
        }
        Ok(())
    }

    fn deliver(&mut self, partition: u32, record: LogRecord) -> Delivery {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.unacked.insert(
            tag,
            Pending {
                partition,
                offset: record.offset,
                envelope: record.envelope.clone(),
            },
        );
        Delivery {
            envelope: record.envelope,
            tag,
            lane: Some(format!("p{partition}")),
        }
    }

    async fn commit_partition(&mut self, partition: u32) -> Result<(), TransportError> {
        let Some(cursor) = self.cursors.get(&partition) else {
            return Ok(());
        };
        let point = cursor.commit_point();
        if point <= cursor.committed {
            return Ok(());
        }
        let log = self.log.clone();
        self.reconnect()
            .run("commit", TransportError::is_retryable, || {
                log.commit(&self.group, &self.topic, partition, point)
            })
            .await?;
        if let Some(cursor) = self.cursors.get_mut(&partition) {
            cursor.committed = cursor.committed.max(point);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionSession for PartitionedSession {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if let Some((partition, record)) = self.buffer.pop_front() {
                return Ok(Some(self.deliver(partition, record)));
            }
            self.refresh_assignment().await?;
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
        Ok(self
            .buffer
            .pop_front()
            .map(|(partition, record)| self.deliver(partition, record)))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        let Some(pending) = self.unacked.remove(&tag) else {
            return Ok(());
        };
        let Some(cursor) = self.cursors.get_mut(&pending.partition) else {
            // 分区已被回收，新的持有者会从已提交位点重读
            debug!(topic = %self.topic, partition = pending.partition, "ack after revoke ignored");
            return Ok(());
        };
        cursor.in_flight.remove(&pending.offset);
        self.commit_partition(pending.partition).await
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        let Some(pending) = self.unacked.remove(&tag) else {
            return Ok(());
        };
        if self.cursors.contains_key(&pending.partition) {
            // 偏移量仍在 in_flight 中，位点不会越过它
            self.buffer.push_front((
                pending.partition,
                LogRecord {
                    offset: pending.offset,
                    envelope: pending.envelope,
                },
            ));
        }
        Ok(())
    }

    fn lane_capacity(&self) -> Option<usize> {
        Some(self.cursors.len().max(1))
    }

    fn prefetch(&self) -> Option<usize> {
        Some(self.config.max_in_flight * self.cursors.len().max(1))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let partitions: Vec<u32> = self.cursors.keys().copied().collect();
        for partition in partitions {
            self.commit_partition(partition).await?;
        }
        let log = self.log.clone();
        self.reconnect()
            .run("leave_group", TransportError::is_retryable, || {
                log.leave_group(&self.group, &self.topic, &self.member)
            })
            .await?;
        debug!(
            topic = %self.topic,
            group = %self.group,
            ephemeral = self.ephemeral,
            "partitioned log subscription closed"
        );
        Ok(())
    }
}
