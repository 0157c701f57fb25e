//! 保序订阅演示
//!
//! 内存 broker 上发布两条流的订单消息，处理器随机注入失败，
//! 保序策略保证每条流的接受顺序与发布顺序一致。
//!
//! 运行：`RUST_LOG=info,ordflow=debug cargo run -p demo`
//!
use async_trait::async_trait;
use chrono::Utc;
use ordflow::{
    BatchContext, BatchHandler, ExponentialBackoff, InMemoryBroker, Message, Subscription,
    SubscriptionConfig,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

struct OrderProjector {
    /// 每条流最近接受的序列号
    last_accepted: Mutex<HashMap<String, u64>>,
    accepted: Mutex<usize>,
}

#[async_trait]
impl BatchHandler for OrderProjector {
    fn handler_name(&self) -> &str {
        "order-projector"
    }

    async fn on_batch(&self, batch: &mut BatchContext) -> anyhow::Result<()> {
        let mut failed_streams: Vec<String> = Vec::new();

        for ctx in batch.iter_mut() {
            let key = ctx.partition_key().to_string();
            let seq = ctx.message().sequence_id();

            // 同批内某条流失败后，其后续消息一并放弃
            if failed_streams.contains(&key) || rand::rng().random_bool(0.1) {
                info!(stream = %key, seq, "simulated processing failure");
                failed_streams.push(key);
                ctx.nack();
                continue;
            }

            let mut last = self.last_accepted.lock().unwrap();
            let previous = last.insert(key.clone(), seq);
            assert!(
                previous.is_none_or(|p| p < seq),
                "ordering violated on stream {key}: {previous:?} -> {seq}"
            );
            *self.accepted.lock().unwrap() += 1;
            ctx.ack();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = Arc::new(InMemoryBroker::new());
    for stream in ["customer-7", "customer-42"] {
        broker.publish_all((1..=50).map(|seq| {
            Message::builder()
                .message_id(format!("orders/{stream}/{seq}"))
                .topic("orders".to_string())
                .partition_key(stream.to_string())
                .sequence_id(seq)
                .published_at(Utc::now())
                .payload(serde_json::json!({ "stream": stream, "seq": seq }))
                .build()
        }));
    }

    let handler = Arc::new(OrderProjector {
        last_accepted: Mutex::new(HashMap::new()),
        accepted: Mutex::new(0),
    });

    let config = SubscriptionConfig::builder()
        .name("demo-orders".to_string())
        .topics(vec!["orders".to_string()])
        .batch_size(16)
        .poll_timeout(Duration::from_millis(50))
        .guarantee_order(true)
        .backoff(Arc::new(
            ExponentialBackoff::builder()
                .base_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(200))
                .jitter_factor(0.15)
                .build()?,
        ))
        .build();

    let subscription = Arc::new(Subscription::new(
        config,
        broker.clone(),
        Some(broker.clone()),
        handler.clone(),
    )?);
    let handle = subscription.start();

    // 等待全部 100 条被接受
    while *handler.accepted.lock().unwrap() < 100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.shutdown();
    handle.join().await;

    info!(
        accepted = *handler.accepted.lock().unwrap(),
        "all streams processed in order"
    );
    Ok(())
}
