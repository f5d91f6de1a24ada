use anyhow::Result as AnyResult;
use evbus_core::config::{PartitionedLogConfig, StreamLogConfig};
use evbus_core::consumer::EventHandler;
use evbus_core::transport::MemoryAdapter;
use evbus_core::transport::TransportAdapter;
use evbus_core::transport::log::{
    InProcessPartitionedLog, InProcessStreamLog, PartitionedLogAdapter, StreamLogAdapter,
};
use evbus_core::{ConsumerOptions, Event, EventBus, SubscriptionHandle, handler_fn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Seen = Arc<Mutex<Vec<String>>>;

fn recorder() -> (Seen, Arc<dyn EventHandler>) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    let handler = handler_fn("recorder", move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.id().to_string());
            Ok(())
        }
    });
    (seen, handler)
}

fn count(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

async fn wait_until(limit: Duration, cond: impl Fn() -> bool) {
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

fn bus_on(adapter: Arc<dyn TransportAdapter>) -> EventBus {
    EventBus::builder().adapter(adapter).build().unwrap()
}

async fn join(bus: &EventBus, topic: &str, group: Option<&str>) -> AnyResult<(Seen, SubscriptionHandle)> {
    let (seen, handler) = recorder();
    let handle = bus
        .subscribe(topic, handler, ConsumerOptions::default(), group)
        .await?;
    Ok((seen, handle))
}

async fn publish_keyed(bus: &EventBus, topic: &str, n: usize) -> AnyResult<Vec<String>> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let event = Event::builder()
            .topic(topic)
            .payload(json!({"n": i}))
            .key(format!("k-{}", i % 7))
            .build();
        bus.publish(&event).await?;
        ids.push(event.id().to_string());
    }
    Ok(ids)
}

/// 同组成员合起来恰好处理一次，独立订阅各得完整一份
async fn assert_group_semantics(bus: EventBus, topic: &str, shared: bool) -> AnyResult<()> {
    let (a, ha) = join(&bus, topic, Some("workers")).await?;
    let (b, hb) = join(&bus, topic, Some("workers")).await?;
    let (solo, hs) = join(&bus, topic, None).await?;
    // 等成员完成再平衡
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ids = publish_keyed(&bus, topic, 20).await?;
    wait_until(Duration::from_secs(5), || {
        count(&a) + count(&b) >= 20 && count(&solo) >= 20
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let expected: HashSet<String> = ids.into_iter().collect();
    let mut group_ids = a.lock().unwrap().clone();
    group_ids.extend(b.lock().unwrap().iter().cloned());
    assert_eq!(group_ids.len(), 20, "group members must not duplicate work");
    assert_eq!(group_ids.into_iter().collect::<HashSet<_>>(), expected);
    if shared {
        assert!(count(&a) > 0 && count(&b) > 0, "both members should share the load");
    }

    let solo_ids: HashSet<String> = solo.lock().unwrap().iter().cloned().collect();
    assert_eq!(solo_ids, expected);

    ha.shutdown().await;
    hb.shutdown().await;
    hs.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_groups_compete_and_independent_subscribers_fan_out() -> AnyResult<()> {
    let bus = bus_on(Arc::new(MemoryAdapter::unbounded()));
    assert_group_semantics(bus, "order.shipped", true).await
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_log_groups_split_partitions() -> AnyResult<()> {
    let log = Arc::new(InProcessPartitionedLog::new(4));
    let config = PartitionedLogConfig {
        fetch_wait_ms: 20,
        ..PartitionedLogConfig::default()
    };
    let bus = bus_on(Arc::new(PartitionedLogAdapter::new(log, config)?));
    assert_group_semantics(bus, "order.shipped", true).await
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_log_groups_share_one_pending_list() -> AnyResult<()> {
    let log = Arc::new(InProcessStreamLog::new());
    let config = StreamLogConfig {
        fetch_wait_ms: 20,
        ..StreamLogConfig::default()
    };
    let bus = bus_on(Arc::new(StreamLogAdapter::new(log.clone(), config)?));
    // 流式消费组是竞争读取，负载分布取决于谁先读到
    assert_group_semantics(bus, "order.shipped", false).await?;
    assert_eq!(log.pending_count("order.shipped", "workers"), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_backlog_is_delivered_to_first_subscriber() -> AnyResult<()> {
    let bus = bus_on(Arc::new(MemoryAdapter::unbounded()));
    let ids = publish_keyed(&bus, "invoice.created", 3).await?;

    let (seen, handle) = join(&bus, "invoice.created", Some("billing")).await?;
    wait_until(Duration::from_secs(3), || count(&seen) == 3).await;
    assert_eq!(*seen.lock().unwrap(), ids);

    handle.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_concurrency_is_clamped_to_assigned_partitions() -> AnyResult<()> {
    let log = Arc::new(InProcessPartitionedLog::new(2));
    let config = PartitionedLogConfig {
        partitions: 2,
        fetch_wait_ms: 20,
        ..PartitionedLogConfig::default()
    };
    let bus = bus_on(Arc::new(PartitionedLogAdapter::new(log, config)?));

    let current = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (c, p, d) = (current.clone(), peak.clone(), done.clone());
    let handler = handler_fn("clamped", move |_event| {
        let (c, p, d) = (c.clone(), p.clone(), d.clone());
        async move {
            use std::sync::atomic::Ordering::SeqCst;
            let now = c.fetch_add(1, SeqCst) + 1;
            p.fetch_max(now, SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.fetch_sub(1, SeqCst);
            d.fetch_add(1, SeqCst);
            Ok(())
        }
    });
    let options = ConsumerOptions::builder().concurrency(8).build();
    let handle = bus
        .subscribe("telemetry", handler, options, Some("ingest"))
        .await?;

    publish_keyed(&bus, "telemetry", 12).await?;
    wait_until(Duration::from_secs(5), || {
        done.load(std::sync::atomic::Ordering::SeqCst) == 12
    })
    .await;

    assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 12);
    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);

    handle.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_entries_in_local_retry_are_not_claimed_again() -> AnyResult<()> {
    let log = Arc::new(InProcessStreamLog::new());
    let config = StreamLogConfig {
        consumer_timeout_ms: 100,
        fetch_wait_ms: 20,
        ..StreamLogConfig::default()
    };
    let bus = bus_on(Arc::new(StreamLogAdapter::new(log.clone(), config)?));
    let (dead, hd) = join(&bus, "jobs.DLQ", None).await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn("always-fails", move |_event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
        }
    });
    // 重试间隔（200ms、400ms）都长于认领闲置阈值
    let options = ConsumerOptions::builder()
        .max_retries(2)
        .backoff_base_ms(200)
        .backoff_multiplier(2.0)
        .backoff_max_delay_ms(1_000)
        .dlq_topic("jobs.DLQ")
        .build();
    let ha = bus
        .subscribe("jobs", handler.clone(), options.clone(), Some("workers"))
        .await?;
    let hb = bus
        .subscribe("jobs", handler, options, Some("workers"))
        .await?;

    bus.publish(&Event::new("jobs", json!({"job": 1}))).await?;
    wait_until(Duration::from_secs(5), || count(&dead) >= 1).await;
    // 多出来的重试链会在这段时间里产生额外调用或第二条死信
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(count(&dead), 1);
    assert_eq!(log.pending_count("jobs", "workers"), 0);

    ha.shutdown().await;
    hb.shutdown().await;
    hd.shutdown().await;
    bus.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_concurrency_grows_when_peer_leaves() -> AnyResult<()> {
    let log = Arc::new(InProcessPartitionedLog::new(4));
    let config = PartitionedLogConfig {
        partitions: 4,
        fetch_wait_ms: 20,
        ..PartitionedLogConfig::default()
    };
    let bus = bus_on(Arc::new(PartitionedLogAdapter::new(log, config)?));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (c, p, d) = (current.clone(), peak.clone(), done.clone());
    let handler = handler_fn("rebalanced", move |_event| {
        let (c, p, d) = (c.clone(), p.clone(), d.clone());
        async move {
            let now = c.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            c.fetch_sub(1, Ordering::SeqCst);
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let options = ConsumerOptions::builder().concurrency(4).build();
    let ha = bus
        .subscribe("telemetry", handler, options, Some("ingest"))
        .await?;
    let (_, hb) = join(&bus, "telemetry", Some("ingest")).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 另一成员退出后，剩下的成员拿到全部 4 个分区
    hb.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    publish_keyed(&bus, "telemetry", 8).await?;
    wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 8).await;

    assert_eq!(done.load(Ordering::SeqCst), 8);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak > 2 && peak <= 4, "peak concurrency {peak}");

    ha.shutdown().await;
    bus.close().await?;
    Ok(())
}
