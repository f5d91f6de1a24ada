//! 事件总线门面（EventBus）
//!
//! 应用唯一依赖的类型，组合 适配器 + 编解码 + 钩子：
//! - `publish`：编码 → 发布前钩子 → 适配器发送（按重试策略）→ 发布后钩子；
//! - `subscribe`：为每个订阅启动独立的消费运行时；
//! - `request / reply`：请求应答（仅部分适配器支持）；
//! - `close`：取消所有订阅、等待排空并关闭适配器。
//!
//! 可被多个生产者与订阅并发使用，克隆开销为一个 `Arc`。
//!
use crate::backoff::RetryPolicy;
use crate::codec::{Codec, JsonCodec};
use crate::config::{BusConfig, EventBusSettings};
use crate::consumer::runtime::{ConsumerRuntime, RuntimeParts};
use crate::consumer::{ConsumerOptions, EventHandler, SubscriptionHandle, SubscriptionState};
use crate::dlq::{DlqHandler, DlqHandlerAdapter};
use crate::error::{BusError, BusResult, ConfigError, PublishError, RequestError, TransportError};
use crate::event::{Ack, Envelope, Event};
use crate::hooks::{HookRecord, Hooks, Operation};
use crate::transport::{ReplyOutcome, TransportAdapter, build_adapter};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

fn default_codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec::new())
}

/// 发布路径（门面与死信路由共用）
#[derive(Clone)]
pub(crate) struct Publisher {
    adapter: Arc<dyn TransportAdapter>,
    codec: Arc<dyn Codec>,
    hooks: Hooks,
    retry: RetryPolicy,
}

impl Publisher {
    pub(crate) async fn publish(&self, event: &Event) -> Result<Ack, PublishError> {
        let started = Instant::now();
        let result = self.send(event).await;
        self.hooks.after_publish(&HookRecord {
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            ..HookRecord::builder()
                .operation(Operation::Publish)
                .topic(event.topic())
                .event_id(event.id())
                .duration(started.elapsed())
                .build()
        });
        result
    }

    async fn send(&self, event: &Event) -> Result<Ack, PublishError> {
        let bytes = self.codec.encode(event.topic(), event.payload())?;
        self.hooks.before_publish(event);
        let envelope = Envelope::seal(event, bytes);
        let ack = self
            .retry
            .run("publish", TransportError::is_retryable, || {
                self.adapter.publish(envelope.clone())
            })
            .await?;
        Ok(ack)
    }
}

struct BusInner {
    publisher: Publisher,
    config: BusConfig,
    token: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[bon::bon]
impl EventBus {
    /// ```
    /// use evbus_core::bus::EventBus;
    /// use evbus_core::transport::MemoryAdapter;
    /// use std::sync::Arc;
    ///
    /// let bus = EventBus::builder()
    ///     .adapter(Arc::new(MemoryAdapter::unbounded()))
    ///     .build()
    ///     .unwrap();
    /// # let _ = bus;
    /// ```
    #[builder]
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        #[builder(default = default_codec())] codec: Arc<dyn Codec>,
        #[builder(default)] hooks: Hooks,
        #[builder(default)] config: BusConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BusInner {
                publisher: Publisher {
                    adapter,
                    codec,
                    hooks,
                    retry: config.publish_retry,
                },
                config,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl EventBus {
    /// 由完整配置构造（适配器经工厂选择）
    pub fn from_settings(settings: &EventBusSettings, hooks: Hooks) -> Result<Self, ConfigError> {
        settings.validate()?;
        let adapter = build_adapter(&settings.adapter)?;
        Self::builder()
            .adapter(adapter)
            .hooks(hooks)
            .config(settings.bus.clone())
            .build()
    }

    pub fn adapter(&self) -> &Arc<dyn TransportAdapter> {
        &self.inner.publisher.adapter
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn publish(&self, event: &Event) -> Result<Ack, PublishError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.inner.publisher.publish(event).await
    }

    /// 订阅主题；同 `group` 的订阅竞争消费，不同组（或未分组）各得一份完整副本
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        options: ConsumerOptions,
        group: Option<&str>,
    ) -> BusResult<SubscriptionHandle> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        options.validate()?;

        let publisher = &self.inner.publisher;
        let session = publisher.adapter.open_subscription(topic, group).await?;
        let drain_timeout = Duration::from_millis(
            options
                .drain_timeout_ms
                .unwrap_or(self.inner.config.drain_timeout_ms),
        );
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Running);
        let runtime = ConsumerRuntime::new(RuntimeParts {
            topic: topic.to_string(),
            group: group.map(str::to_string),
            session,
            handler,
            options,
            codec: publisher.codec.clone(),
            hooks: publisher.hooks.clone(),
            publisher: publisher.clone(),
            state: state_tx,
            drain_timeout,
            dead_letter_timeout: Duration::from_millis(self.inner.config.dead_letter_timeout_ms),
        });

        let token = self.inner.token.child_token();
        let task = self.inner.tracker.spawn(runtime.run(token.clone()));
        debug!(topic, group = group.unwrap_or("-"), "subscribed");
        Ok(SubscriptionHandle::new(topic, group, token, state_rx, task))
    }

    /// 订阅死信主题，处理器直接拿到 `DlqEntry`；死信消费者自身不再路由死信
    pub async fn subscribe_dlq(
        &self,
        dlq_topic: &str,
        handler: Arc<dyn DlqHandler>,
        options: ConsumerOptions,
        group: Option<&str>,
    ) -> BusResult<SubscriptionHandle> {
        self.subscribe(
            dlq_topic,
            Arc::new(DlqHandlerAdapter::new(handler)),
            options.without_dlq(),
            group,
        )
        .await
    }

    /// 请求应答：发布请求并在 `timeout` 内等待关联的应答
    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Event, RequestError> {
        self.request_event(Event::new(topic, payload), timeout).await
    }

    pub async fn request_event(&self, event: Event, timeout: Duration) -> Result<Event, RequestError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let publisher = &self.inner.publisher;
        let bytes = publisher
            .codec
            .encode(event.topic(), event.payload())
            .map_err(PublishError::from)?;
        publisher.hooks.before_publish(&event);

        let started = Instant::now();
        let result = publisher
            .adapter
            .request(Envelope::seal(&event, bytes), timeout)
            .await;
        publisher.hooks.after_publish(&HookRecord {
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            ..HookRecord::builder()
                .operation(Operation::Publish)
                .topic(event.topic())
                .event_id(event.id())
                .duration(started.elapsed())
                .build()
        });

        let reply = result?;
        let payload = publisher.codec.decode(&reply.topic, &reply.payload)?;
        Ok(reply.open(payload))
    }

    /// 回复一个请求事件；请求方已超时时应答被丢弃并触发 `on_late_reply`
    pub async fn reply(&self, request: &Event, payload: Value) -> Result<ReplyOutcome, RequestError> {
        let correlation_id = request
            .reply_to()
            .ok_or_else(|| RequestError::NoReplyChannel {
                event_id: request.id().to_string(),
            })?;
        let publisher = &self.inner.publisher;
        let reply = Event::builder()
            .topic(request.topic())
            .payload(payload)
            .maybe_tenant_id(request.tenant_id())
            .build();
        let bytes = publisher
            .codec
            .encode(reply.topic(), reply.payload())
            .map_err(PublishError::from)?;

        let outcome = publisher
            .adapter
            .reply(correlation_id, Envelope::seal(&reply, bytes))
            .await?;
        if outcome == ReplyOutcome::Discarded {
            publisher.hooks.on_late_reply(
                &HookRecord::builder()
                    .operation(Operation::LateReply)
                    .topic(request.topic())
                    .event_id(request.id())
                    .success(false)
                    .error("requester no longer waiting")
                    .build(),
            );
        }
        Ok(outcome)
    }

    /// 取消全部订阅，等待它们排空后关闭适配器；可重复调用
    pub async fn close(&self) -> BusResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(subscriptions = self.inner.tracker.len(), "closing event bus");
        self.inner.token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.publisher.adapter.close().await?;
        info!("event bus closed");
        Ok(())
    }
}
