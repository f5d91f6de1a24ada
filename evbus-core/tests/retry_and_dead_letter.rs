use anyhow::Result as AnyResult;
use async_trait::async_trait;
use evbus_core::config::{BusConfig, MemoryConfig, OverflowPolicy};
use evbus_core::dlq::{DlqEntry, DlqHandler, DlqReplay, ReplayOutcome};
use evbus_core::event::HEADER_REPLAY_COUNT;
use evbus_core::hooks::{BusMetrics, Hooks};
use evbus_core::transport::MemoryAdapter;
use evbus_core::{ConsumerOptions, Event, EventBus, SubscriptionState, handler_fn};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn memory_bus(metrics: Arc<BusMetrics>) -> EventBus {
    EventBus::builder()
        .adapter(Arc::new(MemoryAdapter::unbounded()))
        .hooks(Hooks::new().with_all(metrics))
        .build()
        .unwrap()
}

/// 容量为 1 的有界内存总线，死信主题无人消费时很快写满
fn bounded_bus(overflow: OverflowPolicy, metrics: Arc<BusMetrics>) -> AnyResult<EventBus> {
    let adapter = MemoryAdapter::new(MemoryConfig {
        overflow,
        ..MemoryConfig::bounded(1)
    })?;
    let bus = EventBus::builder()
        .adapter(Arc::new(adapter))
        .hooks(Hooks::new().with_all(metrics))
        .config(BusConfig {
            dead_letter_timeout_ms: 100,
            ..BusConfig::default()
        })
        .build()?;
    Ok(bus)
}

#[derive(Default)]
struct Collect {
    entries: Mutex<Vec<DlqEntry>>,
}

#[async_trait]
impl DlqHandler for Collect {
    async fn handle_entry(&self, entry: DlqEntry, _event: &Event) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

async fn wait_until(limit: Duration, cond: impl Fn() -> bool) {
    // 使用 timeout + 轮询条件，减少固定 sleep 带来的不确定性
    let _ = tokio::time::timeout(limit, async {
        loop {
            if cond() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_route_one_entry_to_dead_letter_topic() -> AnyResult<()> {
    let metrics = Arc::new(BusMetrics::new());
    let bus = memory_bus(metrics.clone());

    let collected = Arc::new(Collect::default());
    let dlq = bus
        .subscribe_dlq(
            "order.created.DLQ",
            collected.clone(),
            ConsumerOptions::default(),
            None,
        )
        .await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn("always-fails", move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("inventory service down"))
        }
    });
    let options = ConsumerOptions::builder()
        .max_retries(2)
        .backoff_base_ms(100)
        .dlq_topic("order.created.DLQ")
        .build();
    let sub = bus.subscribe("order.created", handler, options, None).await?;

    let event = Event::builder()
        .topic("order.created")
        .payload(json!({"order_id": "o-1"}))
        .key("o-1")
        .build();
    bus.publish(&event).await?;

    wait_until(Duration::from_secs(5), || {
        !collected.entries.lock().unwrap().is_empty()
    })
    .await;
    // 再等一会，确认不会产生第二条死信
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let entries = collected.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.original_topic, "order.created");
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.original_event.id(), event.id());
    assert_eq!(entry.original_event.key(), Some("o-1"));
    assert!(entry.error.contains("inventory service down"));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.dead_lettered, 1);

    sub.shutdown().await;
    dlq.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_delays_grow_with_backoff() -> AnyResult<()> {
    let bus = memory_bus(Arc::new(BusMetrics::new()));
    let seen = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let record = seen.clone();
    let handler = handler_fn("flaky", move |_event| {
        let record = record.clone();
        async move {
            let mut seen = record.lock().unwrap();
            seen.push(Instant::now());
            if seen.len() < 3 {
                anyhow::bail!("not yet");
            }
            Ok(())
        }
    });
    let options = ConsumerOptions::builder()
        .max_retries(2)
        .backoff_base_ms(100)
        .backoff_multiplier(2.0)
        .build();
    let sub = bus.subscribe("payment.captured", handler, options, None).await?;

    bus.publish(&Event::new("payment.captured", json!({"amount": 10})))
        .await?;
    wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 3).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    let first_gap = seen[1] - seen[0];
    let second_gap = seen[2] - seen[1];
    assert!(first_gap >= Duration::from_millis(100), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(200), "second gap {second_gap:?}");

    sub.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_dead_letter_consumer_does_not_loop() -> AnyResult<()> {
    let metrics = Arc::new(BusMetrics::new());
    let bus = memory_bus(metrics.clone());

    let downstream = Arc::new(AtomicUsize::new(0));
    let counter = downstream.clone();
    let spy = bus
        .subscribe(
            "audit.DLQ.DLQ",
            handler_fn("spy", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            ConsumerOptions::default(),
            None,
        )
        .await?;

    // 普通处理器订阅死信主题且配置了再下一级死信
    let options = ConsumerOptions::builder()
        .max_retries(0)
        .dlq_topic("audit.DLQ.DLQ")
        .build();
    let sub = bus
        .subscribe(
            "audit.DLQ",
            handler_fn("broken", |_event| async {
                Err::<(), _>(anyhow::anyhow!("still broken"))
            }),
            options,
            None,
        )
        .await?;

    let original = Event::new("audit", json!({"user": "u-1"}));
    let dlq_event = DlqEntry::new(original, "boom", 1).into_event("audit.DLQ")?;
    bus.publish(&dlq_event).await?;

    wait_until(Duration::from_secs(3), || metrics.snapshot().dropped >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.dropped, 1);
    assert_eq!(snapshot.dead_lettered, 0);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);

    sub.shutdown().await;
    spy.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_republishes_to_original_topic_after_cooldown() -> AnyResult<()> {
    let bus = memory_bus(Arc::new(BusMetrics::new()));

    let replayed = Arc::new(Mutex::new(Vec::<Event>::new()));
    let sink = replayed.clone();
    let sub = bus
        .subscribe(
            "order.created",
            handler_fn("sink", move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                }
            }),
            ConsumerOptions::default(),
            None,
        )
        .await?;

    let replay = DlqReplay::builder()
        .bus(bus.clone())
        .cooldown(Duration::from_millis(50))
        .max_total_attempts(5)
        .build();
    let original = Event::new("order.created", json!({"order_id": "o-9"}));
    let entry = DlqEntry::new(original.clone(), "timeout", 3);

    let started = Instant::now();
    let outcome = replay.replay(&entry).await?;
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(
        outcome,
        ReplayOutcome::Replayed {
            replay: 1,
            total_attempts: 3
        }
    );

    wait_until(Duration::from_secs(2), || !replayed.lock().unwrap().is_empty()).await;
    let events = replayed.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload(), original.payload());
    assert_eq!(events[0].header(HEADER_REPLAY_COUNT), Some("1"));

    // 累计尝试超出预算的条目不再重放
    let spent = DlqEntry::new(original, "timeout", 5);
    assert_eq!(
        replay.replay(&spent).await?,
        ReplayOutcome::Exhausted { total_attempts: 5 }
    );

    sub.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_dead_letter_topic_does_not_stall_subscription() -> AnyResult<()> {
    let metrics = Arc::new(BusMetrics::new());
    let bus = bounded_bus(OverflowPolicy::Block, metrics.clone())?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let options = ConsumerOptions::builder()
        .max_retries(0)
        .dlq_topic("t.DLQ")
        .build();
    let sub = bus
        .subscribe(
            "t",
            handler_fn("always-fails", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("boom"))
                }
            }),
            options,
            None,
        )
        .await?;

    for i in 0..3 {
        bus.publish(&Event::new("t", json!({ "n": i }))).await?;
    }

    // 第一条写进死信积压，后两条在积压已满时超时
    wait_until(Duration::from_secs(3), || {
        let snapshot = metrics.snapshot();
        snapshot.dead_lettered + snapshot.dead_letter_failures >= 3
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.dead_letter_failures, 2);

    let state = tokio::time::timeout(Duration::from_secs(2), sub.shutdown()).await?;
    assert_eq!(state, SubscriptionState::Stopped);
    tokio::time::timeout(Duration::from_secs(2), bus.close()).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_dead_letter_publish_still_acks_and_keeps_consuming() -> AnyResult<()> {
    let metrics = Arc::new(BusMetrics::new());
    let bus = bounded_bus(OverflowPolicy::Reject, metrics.clone())?;

    // 先占满死信主题的积压队列
    bus.publish(&Event::new("t.DLQ", json!({ "filler": true })))
        .await?;

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let ok_calls = Arc::new(AtomicUsize::new(0));
    let (failing, ok) = (failing_calls.clone(), ok_calls.clone());
    let options = ConsumerOptions::builder()
        .max_retries(0)
        .dlq_topic("t.DLQ")
        .build();
    let sub = bus
        .subscribe(
            "t",
            handler_fn("fails-on-flag", move |event| {
                let (failing, ok) = (failing.clone(), ok.clone());
                async move {
                    if event.payload()["fail"] == json!(true) {
                        failing.fetch_add(1, Ordering::SeqCst);
                        return Err::<(), _>(anyhow::anyhow!("rejected payload"));
                    }
                    ok.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            options,
            None,
        )
        .await?;

    bus.publish(&Event::new("t", json!({ "fail": true }))).await?;
    wait_until(Duration::from_secs(3), || {
        metrics.snapshot().dead_letter_failures >= 1
    })
    .await;

    bus.publish(&Event::new("t", json!({ "fail": false }))).await?;
    wait_until(Duration::from_secs(3), || metrics.snapshot().consumed >= 1).await;
    // 原事件已确认，不会再被投递
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.dead_letter_failures, 1);
    assert_eq!(snapshot.dead_lettered, 0);
    assert_eq!(snapshot.consumed, 1);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sub.state(), SubscriptionState::Running);

    sub.shutdown().await;
    bus.close().await?;
    Ok(())
}
