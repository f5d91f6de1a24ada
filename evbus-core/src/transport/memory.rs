//! 内存适配器（MemoryAdapter）
//!
//! 参考实现，也是测试替身：
//! - 每个主题维护独立队列，默认无界；配置 `max_queue_size` 后发布端在队列写满时
//!   按 `OverflowPolicy` 阻塞或立即拒绝；
//! - 未分组的订阅各自收到完整副本，同组订阅按轮询竞争消费；
//! - 主题尚无订阅者时事件进入积压队列，由第一个打开的会话接管；
//! - 请求应答通过在信封中注入按请求 `id` 关联的隐藏回复引用实现。
//!
use super::{
    AdapterKind, Delivery, DeliveryTag, ReplyOutcome, SubscriptionSession, TransportAdapter,
};
use crate::config::{MemoryConfig, OverflowPolicy};
use crate::error::{ConfigError, RequestError, TimeoutError, TransportError};
use crate::event::{Ack, AckReceipt, Envelope};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const MAX_REROUTES: usize = 8;

#[derive(Clone)]
enum QueueTx {
    Bounded(mpsc::Sender<Envelope>),
    Unbounded(mpsc::UnboundedSender<Envelope>),
}

enum QueueRx {
    Bounded(mpsc::Receiver<Envelope>),
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
}

enum SendFailure {
    Full,
    Closed(Envelope),
}

fn queue(capacity: Option<usize>) -> (QueueTx, QueueRx) {
    match capacity {
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.max(1));
            (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        }
    }
}

impl QueueTx {
    /// 按溢出策略投入队列；`Block` 下可被 `publish_timeout_ms` 截断
    async fn offer(&self, envelope: Envelope, config: &MemoryConfig) -> Result<(), SendFailure> {
        match self {
            Self::Unbounded(tx) => tx.send(envelope).map_err(|e| SendFailure::Closed(e.0)),
            Self::Bounded(tx) => match config.overflow {
                OverflowPolicy::Reject => self.try_offer(envelope),
                OverflowPolicy::Block => {
                    let reserved = match config.publish_timeout_ms {
                        Some(ms) => {
                            match tokio::time::timeout(Duration::from_millis(ms), tx.reserve())
                                .await
                            {
                                Ok(reserved) => reserved,
                                Err(_elapsed) => return Err(SendFailure::Full),
                            }
                        }
                        None => tx.reserve().await,
                    };
                    match reserved {
                        Ok(permit) => {
                            permit.send(envelope);
                            Ok(())
                        }
                        Err(_) => Err(SendFailure::Closed(envelope)),
                    }
                }
            },
        }
    }

    fn try_offer(&self, envelope: Envelope) -> Result<(), SendFailure> {
        match self {
            Self::Unbounded(tx) => tx.send(envelope).map_err(|e| SendFailure::Closed(e.0)),
            Self::Bounded(tx) => tx.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendFailure::Full,
                mpsc::error::TrySendError::Closed(env) => SendFailure::Closed(env),
            }),
        }
    }
}

impl QueueRx {
    async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        match self {
            Self::Bounded(rx) => rx.try_recv().ok(),
            Self::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Bounded(rx) => rx.close(),
            Self::Unbounded(rx) => rx.close(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Fanout(u64),
    Group(String),
    Backlog,
}

struct Target {
    route: Route,
    tx: QueueTx,
}

struct Member {
    id: u64,
    tx: QueueTx,
}

#[derive(Default)]
struct GroupState {
    members: Vec<Member>,
    next: usize,
}

#[derive(Default)]
struct TopicState {
    fanout: Vec<Member>,
    groups: BTreeMap<String, GroupState>,
    backlog: Option<(QueueTx, QueueRx)>,
}

impl TopicState {
    fn has_members(&self) -> bool {
        !self.fanout.is_empty() || self.groups.values().any(|g| !g.members.is_empty())
    }

    fn backlog_target(&mut self, capacity: Option<usize>) -> Target {
        let (tx, _) = self.backlog.get_or_insert_with(|| queue(capacity));
        Target {
            route: Route::Backlog,
            tx: tx.clone(),
        }
    }

    fn next_in_group(&mut self, group: &str) -> Option<Target> {
        let state = self.groups.get_mut(group)?;
        if state.members.is_empty() {
            return None;
        }
        let member = &state.members[state.next % state.members.len()];
        state.next = state.next.wrapping_add(1);
        Some(Target {
            route: Route::Group(group.to_string()),
            tx: member.tx.clone(),
        })
    }
}

struct Inner {
    config: MemoryConfig,
    topics: DashMap<String, TopicState>,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    next_member: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    /// 一次发布的全部目标：每个独立订阅一份，每个消费组一份
    fn targets(&self, topic: &str) -> Vec<Target> {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let state = &mut *entry;

        let mut targets: Vec<Target> = state
            .fanout
            .iter()
            .map(|m| Target {
                route: Route::Fanout(m.id),
                tx: m.tx.clone(),
            })
            .collect();
        let groups: Vec<String> = state.groups.keys().cloned().collect();
        for group in groups {
            if let Some(target) = state.next_in_group(&group) {
                targets.push(target);
            }
        }
        if targets.is_empty() {
            targets.push(state.backlog_target(self.config.max_queue_size));
        }
        targets
    }

    /// 原目标已关闭时的替代去向
    fn reroute(&self, topic: &str, route: &Route) -> Option<Target> {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let state = &mut *entry;
        if let Route::Group(group) = route {
            if let Some(target) = state.next_in_group(group) {
                return Some(target);
            }
        }
        if state.has_members() {
            return None;
        }
        Some(state.backlog_target(self.config.max_queue_size))
    }

    fn join(&self, topic: &str, group: Option<&str>) -> (u64, Route, QueueRx) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let state = &mut *entry;

        let (tx, rx) = match state.backlog.take() {
            Some(backlog) if !state.has_members() => backlog,
            other => {
                state.backlog = other;
                queue(self.config.max_queue_size)
            }
        };

        let route = match group {
            Some(group) => {
                state
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .members
                    .push(Member { id, tx });
                Route::Group(group.to_string())
            }
            None => {
                state.fanout.push(Member { id, tx });
                Route::Fanout(id)
            }
        };
        (id, route, rx)
    }

    fn leave(&self, topic: &str, member_id: u64, route: &Route) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            match route {
                Route::Fanout(_) => state.fanout.retain(|m| m.id != member_id),
                Route::Group(group) => {
                    let now_empty = match state.groups.get_mut(group) {
                        Some(g) => {
                            g.members.retain(|m| m.id != member_id);
                            g.members.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        state.groups.remove(group);
                    }
                }
                Route::Backlog => {}
            }
        }
    }

    /// 会话释放时把残留事件交给同组成员；主题已无订阅者时回到积压队列
    fn requeue_leftovers(&self, topic: &str, route: &Route, leftovers: Vec<Envelope>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for envelope in leftovers {
            let id = envelope.id.clone();
            match self.reroute(topic, route) {
                Some(target) => {
                    if target.tx.try_offer(envelope).is_err() {
                        warn!(topic, event_id = %id, "requeue target full, event dropped");
                    }
                }
                None => {
                    debug!(topic, event_id = %id, "subscription released, copy discarded");
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<usize, TransportError> {
        let topic = envelope.topic.clone();
        let mut queued = 0;
        for target in self.targets(&topic) {
            let mut target = target;
            let mut envelope = envelope.clone();
            let mut reroutes = 0;
            loop {
                match target.tx.offer(envelope, &self.config).await {
                    Ok(()) => {
                        if target.route != Route::Backlog {
                            queued += 1;
                        }
                        break;
                    }
                    Err(SendFailure::Full) => {
                        return Err(TransportError::QueueFull {
                            topic: topic.clone(),
                        });
                    }
                    Err(SendFailure::Closed(returned)) => {
                        reroutes += 1;
                        let next = if reroutes > MAX_REROUTES {
                            None
                        } else {
                            self.reroute(&topic, &target.route)
                        };
                        match next {
                            Some(next) => {
                                target = next;
                                envelope = returned;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        Ok(queued)
    }
}

/// 进程内适配器，克隆后共享同一组主题
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<Inner>,
}

impl MemoryAdapter {
    pub fn new(config: MemoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    /// 无界、阻塞策略的默认实例
    pub fn unbounded() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    fn with_config(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: DashMap::new(),
                pending: DashMap::new(),
                next_member: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// 尚未被任何请求等待的关联项数量
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

/// 离开作用域时清理关联项（应答、超时、调用方取消三种路径统一）
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Envelope>>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn publish(&self, envelope: Envelope) -> Result<Ack, TransportError> {
        self.ensure_open()?;
        let event_id = envelope.id.clone();
        let topic = envelope.topic.clone();
        let queued = self.inner.dispatch(envelope).await?;
        debug!(topic = %topic, event_id = %event_id, queued, "memory publish");
        Ok(Ack {
            event_id,
            topic,
            receipt: AckReceipt::Memory { queued },
        })
    }

    async fn open_subscription(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Box<dyn SubscriptionSession>, TransportError> {
        self.ensure_open()?;
        let (member_id, route, rx) = self.inner.join(topic, group);
        debug!(topic, group = group.unwrap_or("-"), member_id, "memory subscription opened");
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            route,
            member_id,
            rx,
            redeliver: VecDeque::new(),
            unacked: HashMap::new(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn request(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RequestError> {
        self.ensure_open()?;
        let correlation_id = envelope.id.clone();
        let topic = envelope.topic.clone();
        envelope.reply_to = Some(correlation_id.clone());

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: correlation_id,
        };

        let exchange = async {
            self.inner.dispatch(envelope).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Err(TimeoutError { topic, timeout }.into()),
        }
    }

    async fn reply(
        &self,
        correlation_id: &str,
        envelope: Envelope,
    ) -> Result<ReplyOutcome, RequestError> {
        let Some((_, tx)) = self.inner.pending.remove(correlation_id) else {
            debug!(correlation_id, "late reply discarded");
            return Ok(ReplyOutcome::Discarded);
        };
        match tx.send(envelope) {
            Ok(()) => Ok(ReplyOutcome::Delivered),
            Err(_) => {
                debug!(correlation_id, "requester gone, reply discarded");
                Ok(ReplyOutcome::Discarded)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // 丢弃所有发送端：会话读完已入队事件后结束
        self.inner.topics.clear();
        self.inner.pending.clear();
        Ok(())
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    topic: String,
    route: Route,
    member_id: u64,
    rx: QueueRx,
    redeliver: VecDeque<Envelope>,
    unacked: HashMap<DeliveryTag, Envelope>,
    next_tag: u64,
    closed: bool,
}

impl MemorySession {
    fn track(&mut self, envelope: Envelope) -> Delivery {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.unacked.insert(tag, envelope.clone());
        Delivery {
            lane: envelope.key.clone(),
            envelope,
            tag,
        }
    }
}

#[async_trait]
impl SubscriptionSession for MemorySession {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(envelope) = self.redeliver.pop_front() {
            return Ok(Some(self.track(envelope)));
        }
        match self.rx.recv().await {
            Some(envelope) => Ok(Some(self.track(envelope))),
            None => Ok(None),
        }
    }

    fn poll(&mut self) -> Result<Option<Delivery>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        let next = self.redeliver.pop_front().or_else(|| self.rx.try_recv());
        Ok(next.map(|envelope| self.track(envelope)))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        if self.unacked.remove(&tag).is_none() {
            debug!(topic = %self.topic, %tag, "ack for unknown delivery ignored");
        }
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        if let Some(envelope) = self.unacked.remove(&tag) {
            self.redeliver.push_front(envelope);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.leave(&self.topic, self.member_id, &self.route);

        self.rx.close();
        let mut leftovers: Vec<Envelope> = self.unacked.drain().map(|(_, e)| e).collect();
        leftovers.extend(self.redeliver.drain(..));
        while let Some(envelope) = self.rx.try_recv() {
            leftovers.push(envelope);
        }
        if !leftovers.is_empty() {
            debug!(topic = %self.topic, count = leftovers.len(), "requeueing undelivered events");
            self.inner
                .requeue_leftovers(&self.topic, &self.route, leftovers);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.inner.leave(&self.topic, self.member_id, &self.route);
        }
    }
}
