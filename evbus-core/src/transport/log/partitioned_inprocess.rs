use super::{GroupAssignment, LogRecord, PartitionedLog};
use crate::error::TransportError;
use crate::event::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Default)]
struct Partition {
    /// 保留窗口内第一条记录的偏移量
    start: u64,
    records: VecDeque<Envelope>,
}

impl Partition {
    fn end(&self) -> u64 {
        self.start + self.records.len() as u64
    }
}

#[derive(Default)]
struct Group {
    generation: u64,
    members: Vec<String>,
}

impl Group {
    /// 区间式分配：分区 p 归第 `p % n` 个成员
    fn assignment_of(&self, member: &str, partitions: u32) -> GroupAssignment {
        let Some(index) = self.members.iter().position(|m| m == member) else {
            return GroupAssignment {
                generation: self.generation,
                partitions: Vec::new(),
            };
        };
        let n = self.members.len() as u32;
        GroupAssignment {
            generation: self.generation,
            partitions: (0..partitions).filter(|p| p % n == index as u32).collect(),
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Partition>>,
    commits: HashMap<(String, String, u32), u64>,
    groups: HashMap<(String, String), Group>,
}

/// 进程内分区日志 broker
///
/// 行为对齐常见分区日志：键决定分区、组内按代分配分区、偏移量由组提交。
/// `set_available(false)` 可模拟 broker 宕机。
pub struct InProcessPartitionedLog {
    default_partitions: u32,
    retention: Option<usize>,
    state: Mutex<State>,
    notifiers: DashMap<String, Arc<Notify>>,
    available: AtomicBool,
}

impl InProcessPartitionedLog {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            retention: None,
            state: Mutex::new(State::default()),
            notifiers: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// 每个分区只保留最近 `records` 条
    pub fn with_retention(mut self, records: Option<usize>) -> Self {
        self.retention = records;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// 组在该主题上的当前代数与成员数
    pub fn group_members(&self, group: &str, topic: &str) -> usize {
        self.lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::unavailable("partitioned log broker unreachable"))
        }
    }

    fn notifier(&self, topic: &str) -> Arc<Notify> {
        self.notifiers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn ensure_topic<'a>(&self, state: &'a mut State, topic: &str) -> &'a mut Vec<Partition> {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..self.default_partitions).map(|_| Partition::default()).collect())
    }

    fn partition<'a>(
        &self,
        state: &'a mut State,
        topic: &str,
        partition: u32,
    ) -> Result<&'a mut Partition, TransportError> {
        self.ensure_topic(state, topic)
            .get_mut(partition as usize)
            .ok_or_else(|| {
                TransportError::broker(format!("unknown partition {partition} for topic {topic}"))
            })
    }
}

#[async_trait]
impl PartitionedLog for InProcessPartitionedLog {
    async fn partition_count(&self, topic: &str) -> Result<u32, TransportError> {
        self.check()?;
        let mut state = self.lock();
        Ok(self.ensure_topic(&mut state, topic).len() as u32)
    }

    async fn append(
        &self,
        topic: &str,
        partition: u32,
        envelope: Envelope,
    ) -> Result<u64, TransportError> {
        self.check()?;
        let offset = {
            let mut state = self.lock();
            let retention = self.retention;
            let log = self.partition(&mut state, topic, partition)?;
            let offset = log.end();
            log.records.push_back(envelope);
            if let Some(limit) = retention {
                while log.records.len() > limit {
                    log.records.pop_front();
                    log.start += 1;
                }
            }
            offset
        };
        self.notifier(topic).notify_waiters();
        Ok(offset)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, TransportError> {
        self.check()?;
        let mut state = self.lock();
        let log = self.partition(&mut state, topic, partition)?;
        let from = from_offset.max(log.start);
        let skip = (from - log.start) as usize;
        Ok(log
            .records
            .iter()
            .skip(skip)
            .take(max)
            .enumerate()
            .map(|(i, envelope)| LogRecord {
                offset: from + i as u64,
                envelope: envelope.clone(),
            })
            .collect())
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError> {
        self.check()?;
        let mut state = self.lock();
        Ok(self.partition(&mut state, topic, partition)?.start)
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError> {
        self.check()?;
        let mut state = self.lock();
        Ok(self.partition(&mut state, topic, partition)?.end())
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), TransportError> {
        self.check()?;
        let mut state = self.lock();
        let slot = state
            .commits
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        // 位点只前进
        *slot = (*slot).max(offset);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, TransportError> {
        self.check()?;
        let state = self.lock();
        Ok(state
            .commits
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn join_group(
        &self,
        group: &str,
        topic: &str,
        member: &str,
    ) -> Result<GroupAssignment, TransportError> {
        self.check()?;
        let mut state = self.lock();
        let partitions = self.ensure_topic(&mut state, topic).len() as u32;
        let entry = state
            .groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();
        if !entry.members.iter().any(|m| m == member) {
            entry.members.push(member.to_string());
            entry.generation += 1;
        }
        Ok(entry.assignment_of(member, partitions))
    }

    async fn assignment(
        &self,
        group: &str,
        topic: &str,
        member: &str,
    ) -> Result<GroupAssignment, TransportError> {
        self.check()?;
        let mut state = self.lock();
        let partitions = self.ensure_topic(&mut state, topic).len() as u32;
        Ok(state
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.assignment_of(member, partitions))
            .unwrap_or_default())
    }

    async fn leave_group(
        &self,
        group: &str,
        topic: &str,
        member: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        let mut state = self.lock();
        let key = (group.to_string(), topic.to_string());
        if let Some(entry) = state.groups.get_mut(&key) {
            let before = entry.members.len();
            entry.members.retain(|m| m != member);
            if entry.members.len() != before {
                entry.generation += 1;
            }
        }
        drop(state);
        // 唤醒同组成员尽快感知再平衡
        self.notifier(topic).notify_waiters();
        Ok(())
    }

    async fn wait_for_data(&self, topic: &str, timeout: Duration) {
        let notify = self.notifier(topic);
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
    }
}
