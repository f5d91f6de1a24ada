//! 消费运行时：订阅的核心状态机
//!
//! 每个订阅一个循环任务，独占适配器会话：
//! - 拉取：已接收未确认数低于 `max_in_flight` 时才从会话取新事件；
//! - 分发：最多 `concurrency` 个处理器并发执行，同一 lane 串行；并发上限随会话的
//!   lane 容量（分区日志的分配）在每轮循环重新计算；
//! - 保活：会话声明保活周期时定期续约未确认的投递，避免本地重试期间被组内认领；
//! - 重试：按退避延迟放入本地定时队列，不阻塞其他事件，也不回到 broker 重新拉取；
//! - 死信：重试耗尽后经由总线发布 `DlqEntry`，发布受 `dead_letter_timeout` 限制，
//!   无论发布结果如何（包括超时）都确认原事件；
//! - 取消：停止拉取，在排空超时内等待处理中的事件，交还其余事件后关闭会话。
//!
use super::lanes::LaneTable;
use super::{ConsumerOptions, DeliveryState, EventHandler, SubscriptionState};
use crate::backoff;
use crate::bus::Publisher;
use crate::codec::Codec;
use crate::dlq::DlqEntry;
use crate::error::{HandlerError, TransportError};
use crate::event::{Event, HEADER_DLQ_ORIGINAL_TOPIC};
use crate::hooks::{HookRecord, Hooks, Operation, panic_message};
use crate::transport::{Delivery, DeliveryTag, SubscriptionSession};
use futures_util::FutureExt;
use futures_util::future::poll_fn;
use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, warn};

/// 一个待处理（或待重试）的事件
struct Work {
    tag: DeliveryTag,
    lane: Option<String>,
    event: Arc<Event>,
    /// 即将进行的第几次尝试，从 1 开始
    attempt: u32,
}

struct Finished {
    work: Work,
    outcome: Result<(), String>,
    elapsed: Duration,
}

pub(crate) struct RuntimeParts {
    pub topic: String,
    pub group: Option<String>,
    pub session: Box<dyn SubscriptionSession>,
    pub handler: Arc<dyn EventHandler>,
    pub options: ConsumerOptions,
    pub codec: Arc<dyn Codec>,
    pub hooks: Hooks,
    pub publisher: Publisher,
    pub state: watch::Sender<SubscriptionState>,
    pub drain_timeout: Duration,
    pub dead_letter_timeout: Duration,
}

pub(crate) struct ConsumerRuntime {
    topic: String,
    group: Option<String>,
    session: Box<dyn SubscriptionSession>,
    handler: Arc<dyn EventHandler>,
    options: ConsumerOptions,
    codec: Arc<dyn Codec>,
    hooks: Hooks,
    publisher: Publisher,
    state: watch::Sender<SubscriptionState>,
    /// 订阅请求的并发数，实际值受会话 lane 容量限制
    requested_concurrency: usize,
    concurrency: usize,
    max_in_flight: usize,
    drain_timeout: Duration,
    dead_letter_timeout: Duration,
    /// 已接收、尚未 ack / nack 的事件数
    outstanding: usize,
    ready: VecDeque<Work>,
    lanes: LaneTable<Work>,
    tasks: JoinSet<Finished>,
    running: HashMap<task::Id, (DeliveryTag, Option<String>)>,
    retries: DelayQueue<Work>,
    retry_keys: HashMap<DeliveryTag, delay_queue::Key>,
    keepalive: Option<Interval>,
}

fn poll_keepalive(keepalive: &mut Option<Interval>, cx: &mut Context<'_>) -> Poll<()> {
    match keepalive {
        Some(interval) => interval.poll_tick(cx).map(|_| ()),
        None => Poll::Pending,
    }
}

impl ConsumerRuntime {
    pub(crate) fn new(parts: RuntimeParts) -> Self {
        let RuntimeParts {
            topic,
            group,
            session,
            handler,
            options,
            codec,
            hooks,
            publisher,
            state,
            drain_timeout,
            dead_letter_timeout,
        } = parts;

        let requested_concurrency = options.concurrency.max(1);
        let mut runtime = Self {
            topic,
            group,
            session,
            handler,
            options,
            codec,
            hooks,
            publisher,
            state,
            requested_concurrency,
            concurrency: requested_concurrency,
            max_in_flight: requested_concurrency,
            drain_timeout,
            dead_letter_timeout,
            outstanding: 0,
            ready: VecDeque::new(),
            lanes: LaneTable::default(),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            retries: DelayQueue::new(),
            retry_keys: HashMap::new(),
            keepalive: None,
        };
        runtime.apply_limits();
        runtime
    }

    /// 按会话当前的 lane 容量与预取上限重新计算并发和在途上限
    fn apply_limits(&mut self) {
        let mut concurrency = self.requested_concurrency;
        if let Some(lanes) = self.session.lane_capacity() {
            concurrency = concurrency.min(lanes.max(1));
        }
        if concurrency != self.concurrency {
            if concurrency < self.requested_concurrency {
                warn!(
                    topic = %self.topic,
                    requested = self.requested_concurrency,
                    assigned = concurrency,
                    "concurrency exceeds assigned partitions, clamped"
                );
            } else {
                debug!(topic = %self.topic, concurrency, "concurrency limit restored");
            }
            self.concurrency = concurrency;
        }

        let mut max_in_flight = self
            .options
            .max_in_flight
            .unwrap_or(concurrency * 4)
            .max(concurrency);
        if let Some(prefetch) = self.session.prefetch() {
            max_in_flight = max_in_flight.min(prefetch.max(1));
        }
        self.max_in_flight = max_in_flight;
    }

    /// 运行直到取消或传输层失败
    pub(crate) async fn run(mut self, token: CancellationToken) {
        self.keepalive = self.session.keepalive_interval().map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        info!(
            topic = %self.topic,
            group = self.group_label(),
            handler = self.handler.handler_name(),
            concurrency = self.concurrency,
            max_in_flight = self.max_in_flight,
            "subscription running"
        );

        let mut outcome = self.consume(&token).await;
        if outcome.is_ok() {
            outcome = self.drain().await;
        }
        if outcome.is_ok() {
            outcome = self.session.close().await;
        }

        match outcome {
            Ok(()) => {
                info!(topic = %self.topic, group = self.group_label(), "subscription stopped");
                self.state.send_replace(SubscriptionState::Stopped);
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn consume(&mut self, token: &CancellationToken) -> Result<(), TransportError> {
        loop {
            self.apply_limits();
            self.dispatch_ready();
            let can_fetch = self.outstanding < self.max_in_flight;

            tokio::select! {
                biased;

                _ = token.cancelled() => return Ok(()),

                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined, false).await?;
                }

                Some(expired) = poll_fn(|cx| self.retries.poll_expired(cx)), if !self.retries.is_empty() => {
                    let work = expired.into_inner();
                    self.retry_keys.remove(&work.tag);
                    self.ready.push_back(work);
                }

                _ = poll_fn(|cx| poll_keepalive(&mut self.keepalive, cx)), if self.keepalive.is_some() => {
                    self.session.keep_alive().await?;
                }

                received = self.session.recv(), if can_fetch => {
                    match received? {
                        Some(delivery) => {
                            self.accept(delivery).await?;
                            while self.outstanding < self.max_in_flight {
                                match self.session.poll()? {
                                    Some(delivery) => self.accept(delivery).await?,
                                    None => break,
                                }
                            }
                        }
                        None => {
                            info!(topic = %self.topic, "subscription session ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// 解码并按 lane 入队；无法解码的载荷直接确认丢弃
    async fn accept(&mut self, delivery: Delivery) -> Result<(), TransportError> {
        self.outstanding += 1;
        let Delivery {
            envelope,
            tag,
            lane,
        } = delivery;

        let payload = match self.codec.decode(&envelope.topic, &envelope.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    topic = %self.topic,
                    event_id = %envelope.id,
                    error = %err,
                    "undecodable payload, event dropped"
                );
                self.hooks.on_event_dropped(&HookRecord {
                    success: false,
                    error: Some(err.to_string()),
                    ..self.record(Operation::Drop, Some(envelope.id.as_str()))
                });
                return self.ack(tag).await;
            }
        };

        let event = Arc::new(envelope.open(payload));
        self.transition(&event, 1, DeliveryState::Received);
        let work = Work {
            tag,
            lane,
            event,
            attempt: 1,
        };
        let lane = work.lane.clone();
        if let Some(work) = self.lanes.admit(lane.as_deref(), work) {
            self.ready.push_back(work);
        }
        Ok(())
    }

    fn dispatch_ready(&mut self) {
        while self.tasks.len() < self.concurrency {
            let Some(work) = self.ready.pop_front() else {
                break;
            };
            self.spawn(work);
        }
    }

    fn spawn(&mut self, work: Work) {
        self.hooks.on_receive(&work.event, work.attempt);
        self.transition(&work.event, work.attempt, DeliveryState::Processing);

        let tag = work.tag;
        let lane = work.lane.clone();
        let handler = self.handler.clone();
        let abort = self.tasks.spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(handler.handle(&work.event))
                .catch_unwind()
                .await;
            let outcome = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(panic) => Err(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            Finished {
                work,
                outcome,
                elapsed: started.elapsed(),
            }
        });
        self.running.insert(abort.id(), (tag, lane));
    }

    async fn on_joined(
        &mut self,
        joined: Result<(task::Id, Finished), JoinError>,
        draining: bool,
    ) -> Result<(), TransportError> {
        match joined {
            Ok((id, finished)) => {
                self.running.remove(&id);
                self.settle(finished, draining).await
            }
            Err(err) => {
                let Some((tag, lane)) = self.running.remove(&err.id()) else {
                    return Ok(());
                };
                warn!(topic = %self.topic, %tag, error = %err, "handler task aborted, returning event");
                self.release_lane(lane.as_deref());
                self.nack(tag).await
            }
        }
    }

    async fn settle(&mut self, finished: Finished, draining: bool) -> Result<(), TransportError> {
        let Finished {
            work,
            outcome,
            elapsed,
        } = finished;

        let reason = match outcome {
            Ok(()) => {
                self.hooks.after_consume(&HookRecord {
                    duration: elapsed,
                    retry_count: Some(work.attempt - 1),
                    ..self.record(Operation::Consume, Some(work.event.id()))
                });
                self.ack(work.tag).await?;
                self.transition(&work.event, work.attempt, DeliveryState::Acked);
                self.release_lane(work.lane.as_deref());
                return Ok(());
            }
            Err(reason) => reason,
        };

        let failure = HandlerError {
            handler: self.handler.handler_name().to_string(),
            reason,
        };
        self.hooks.after_consume(&HookRecord {
            duration: elapsed,
            success: false,
            retry_count: Some(work.attempt - 1),
            error: Some(failure.to_string()),
            ..self.record(Operation::Consume, Some(work.event.id()))
        });
        warn!(
            topic = %self.topic,
            event_id = %work.event.id(),
            attempt = work.attempt,
            max_retries = self.options.max_retries,
            error = %failure,
            "event handler failed"
        );

        if work.attempt > self.options.max_retries {
            return self.dead_letter(work, failure).await;
        }

        if draining {
            // 排空期间不再排期，交还适配器重投
            self.release_lane(work.lane.as_deref());
            return self.nack(work.tag).await;
        }

        let delay = backoff::delay(work.attempt, &self.options);
        self.hooks.on_retry_scheduled(
            &HookRecord {
                success: false,
                retry_count: Some(work.attempt),
                error: Some(failure.reason.clone()),
                ..self.record(Operation::Retry, Some(work.event.id()))
            },
            delay,
        );
        debug!(
            topic = %self.topic,
            event_id = %work.event.id(),
            attempt = work.attempt,
            delay_ms = delay.as_millis() as u64,
            state = DeliveryState::Retrying.as_str(),
            "retry scheduled"
        );

        let tag = work.tag;
        let key = self.retries.insert(
            Work {
                attempt: work.attempt + 1,
                ..work
            },
            delay,
        );
        self.retry_keys.insert(tag, key);
        Ok(())
    }

    /// 重试耗尽：发布死信（或记录丢弃），随后无条件确认原事件
    async fn dead_letter(&mut self, work: Work, failure: HandlerError) -> Result<(), TransportError> {
        let event_id = work.event.id().to_string();

        if work.event.header(HEADER_DLQ_ORIGINAL_TOPIC).is_some() {
            warn!(
                topic = %self.topic,
                event_id = %event_id,
                "dead letter entry failed again, not re-routed"
            );
            self.drop_event(&work, &failure);
        } else if let Some(dlq_topic) = self.options.dlq_topic.clone() {
            let entry = DlqEntry::new((*work.event).clone(), failure.to_string(), work.attempt);
            let started = Instant::now();
            let published = match entry.into_event(&dlq_topic) {
                // 死信主题写不进去时不能让整个订阅卡在这里
                Ok(dlq_event) => match tokio::time::timeout(
                    self.dead_letter_timeout,
                    self.publisher.publish(&dlq_event),
                )
                .await
                {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_elapsed) => Err(format!(
                        "dead letter publish timed out after {}ms",
                        self.dead_letter_timeout.as_millis()
                    )),
                },
                Err(err) => Err(err.to_string()),
            };
            let record = HookRecord {
                duration: started.elapsed(),
                retry_count: Some(work.attempt - 1),
                ..self.record(Operation::DeadLetter, Some(event_id.as_str()))
            };
            match published {
                Ok(_) => {
                    info!(
                        topic = %self.topic,
                        dlq_topic = %dlq_topic,
                        event_id = %event_id,
                        attempts = work.attempt,
                        state = DeliveryState::DeadLettered.as_str(),
                        "event dead-lettered"
                    );
                    self.hooks.on_dead_letter(&record);
                }
                Err(err) => {
                    error!(
                        topic = %self.topic,
                        dlq_topic = %dlq_topic,
                        event_id = %event_id,
                        error = %err,
                        "dead letter publish failed, acking original anyway"
                    );
                    self.hooks.on_dead_letter(&HookRecord {
                        success: false,
                        error: Some(err),
                        ..record
                    });
                }
            }
        } else {
            warn!(
                topic = %self.topic,
                event_id = %event_id,
                attempts = work.attempt,
                error = %failure,
                "retries exhausted without dead letter topic, event dropped"
            );
            self.drop_event(&work, &failure);
        }

        self.ack(work.tag).await?;
        self.release_lane(work.lane.as_deref());
        Ok(())
    }

    fn drop_event(&self, work: &Work, failure: &HandlerError) {
        self.transition(&work.event, work.attempt, DeliveryState::Dropped);
        self.hooks.on_event_dropped(&HookRecord {
            success: false,
            retry_count: Some(work.attempt - 1),
            error: Some(failure.to_string()),
            ..self.record(Operation::Drop, Some(work.event.id()))
        });
    }

    /// 取消后的排空：未开始的事件立即交还，处理中的事件在超时内等待完成
    async fn drain(&mut self) -> Result<(), TransportError> {
        self.state.send_replace(SubscriptionState::Draining);
        info!(
            topic = %self.topic,
            group = self.group_label(),
            in_flight = self.tasks.len(),
            retrying = self.retry_keys.len(),
            queued = self.ready.len() + self.lanes.waiting_len(),
            "subscription draining"
        );

        let retrying: Vec<DeliveryTag> = self.retry_keys.drain().map(|(tag, _)| tag).collect();
        self.retries.clear();
        for tag in retrying {
            self.nack(tag).await?;
        }
        let mut unstarted: Vec<Work> = self.ready.drain(..).collect();
        unstarted.extend(self.lanes.drain_waiting());
        for work in unstarted {
            self.nack(work.tag).await?;
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => self.on_joined(joined, true).await?,
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(
                        topic = %self.topic,
                        remaining = self.tasks.len(),
                        timeout_ms = self.drain_timeout.as_millis() as u64,
                        "drain timeout, aborting handlers"
                    );
                    self.tasks.abort_all();
                    while let Some(joined) = self.tasks.join_next_with_id().await {
                        self.on_joined(joined, true).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail(&mut self, err: TransportError) {
        error!(
            topic = %self.topic,
            group = self.group_label(),
            error = %err,
            "subscription failed, no longer consuming"
        );
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.retries.clear();
        if let Err(close_err) = self.session.close().await {
            debug!(topic = %self.topic, error = %close_err, "session close after failure");
        }
        self.hooks.on_subscription_failed(&HookRecord {
            success: false,
            error: Some(err.to_string()),
            ..self.record(Operation::SubscriptionFailed, None)
        });
        self.state.send_replace(SubscriptionState::Failed);
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.session.ack(tag).await
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.session.nack(tag).await
    }

    fn release_lane(&mut self, lane: Option<&str>) {
        if let Some(next) = self.lanes.release(lane) {
            self.ready.push_back(next);
        }
    }

    fn record(&self, operation: Operation, event_id: Option<&str>) -> HookRecord {
        HookRecord::builder()
            .operation(operation)
            .topic(self.topic.clone())
            .maybe_group(self.group.clone())
            .maybe_event_id(event_id)
            .build()
    }

    fn transition(&self, event: &Event, attempt: u32, state: DeliveryState) {
        debug!(
            topic = %self.topic,
            event_id = %event.id(),
            attempt,
            state = state.as_str(),
            "delivery state"
        );
    }

    fn group_label(&self) -> &str {
        self.group.as_deref().unwrap_or("-")
    }
}
