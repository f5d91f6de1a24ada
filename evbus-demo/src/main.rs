//! 订单流程演示：发布、消费、重试、死信、请求应答与计数钩子
//!
//! 环境变量：
//! - `EVBUS_CONFIG`：JSON 形式的总线配置，缺省为内存适配器；
//! - `EVBUS_LOG_FORMAT=json`：以 JSON 输出日志；
//! - `RUST_LOG`：日志过滤。
//!
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use evbus_core::config::EventBusSettings;
use evbus_core::dlq::{DlqEntry, DlqHandler};
use evbus_core::error::RequestError;
use evbus_core::hooks::{BusMetrics, Hooks, LoggingHook};
use evbus_core::{ConsumerOptions, Event, EventBus, handler_fn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const ORDER_CREATED: &str = "order.created";
const ORDER_DLQ: &str = "order.created.DLQ";
const PRICING_QUOTE: &str = "pricing.quote";

fn init_logging() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evbus_core=debug"));
    let builder = fmt::fmt().with_env_filter(env_filter).with_target(false);
    let installed = match std::env::var("EVBUS_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn load_settings() -> Result<EventBusSettings> {
    match std::env::var("EVBUS_CONFIG") {
        Ok(raw) => Ok(EventBusSettings::from_json_str(&raw)?),
        Err(_) => Ok(EventBusSettings::default()),
    }
}

struct AlertOnDeadLetter;

#[async_trait]
impl DlqHandler for AlertOnDeadLetter {
    fn handler_name(&self) -> &str {
        "order-alert"
    }

    async fn handle_entry(&self, entry: DlqEntry, _event: &Event) -> Result<()> {
        warn!(
            original_topic = %entry.original_topic,
            event_id = %entry.original_event.id(),
            attempts = entry.retry_count,
            error = %entry.error,
            "order needs manual attention"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let metrics = Arc::new(BusMetrics::new());
    let hooks = Hooks::new()
        .with_all(Arc::new(LoggingHook))
        .with_all(metrics.clone());
    let settings = load_settings()?;
    let bus = EventBus::from_settings(&settings, hooks)?;
    info!(adapter = %bus.adapter().kind(), "event bus ready");

    let dlq = bus
        .subscribe_dlq(ORDER_DLQ, Arc::new(AlertOnDeadLetter), ConsumerOptions::default(), Some("ops"))
        .await?;

    // 库存服务：数量超过 10 的订单始终失败
    let inventory = handler_fn("inventory", |event| async move {
        let qty = event.payload()["qty"].as_u64().unwrap_or(0);
        if qty > 10 {
            return Err(anyhow!("insufficient stock for qty={qty}"));
        }
        info!(order_id = %event.key().unwrap_or("-"), qty, "stock reserved");
        Ok(())
    });
    let options = ConsumerOptions::builder()
        .max_retries(2)
        .backoff_base_ms(100)
        .dlq_topic(ORDER_DLQ)
        .concurrency(4)
        .build();
    let orders = bus
        .subscribe(ORDER_CREATED, inventory, options, Some("inventory"))
        .await?;

    let responder = bus.clone();
    let pricing = bus
        .subscribe(
            PRICING_QUOTE,
            handler_fn("pricing", move |request| {
                let responder = responder.clone();
                async move {
                    let qty = request.payload()["qty"].as_u64().unwrap_or(0);
                    responder.reply(&request, json!({"total": qty * 25})).await?;
                    Ok(())
                }
            }),
            ConsumerOptions::default(),
            Some("pricing"),
        )
        .await?;

    for (order_id, qty) in [("o-1", 2), ("o-2", 42), ("o-3", 5)] {
        let event = Event::builder()
            .topic(ORDER_CREATED)
            .payload(json!({"order_id": order_id, "qty": qty}))
            .key(order_id)
            .build();
        let ack = bus.publish(&event).await?;
        info!(event_id = %ack.event_id, receipt = ?ack.receipt, "order published");
    }

    match bus
        .request(PRICING_QUOTE, json!({"qty": 3}), Duration::from_secs(1))
        .await
    {
        Ok(reply) => info!(quote = %reply.payload(), "quote received"),
        Err(RequestError::Unsupported(err)) => info!(%err, "request/reply not available"),
        Err(err) => warn!(%err, "quote request failed"),
    }

    // 等待重试与死信走完，或提前按 Ctrl-C 结束
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    orders.shutdown().await;
    pricing.shutdown().await;
    dlq.shutdown().await;
    bus.close().await?;

    let snapshot = serde_json::to_string_pretty(&metrics.snapshot())?;
    info!(metrics = %snapshot, "final counters");
    Ok(())
}
