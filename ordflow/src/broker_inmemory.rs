//! 内存版 broker（InMemoryBroker）
//!
//! 基于每主题 `VecDeque` 的轻量实现，同时满足 `BrokerConsumer` 与
//! `BrokerAdmin` 协议：
//! - `next_batch`：按主题名有序轮询出队，最长等待 `poll_timeout`；
//! - `finalize_batch`：ack 记账；nack 按原有相对顺序回插队首，
//!   等价于“游标不前进、后续重投”；
//! - 典型用途：测试环境、示例与本地开发。
//!
use crate::affinity::PartitionAffinity;
use crate::broker::{BrokerAdmin, BrokerConsumer};
use crate::error::EngineResult;
use crate::message::{Message, MessageContext};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time;

/// 简单的内存 broker 实现
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, VecDeque<Message>>,
    affinity: RwLock<PartitionAffinity>,
    /// 消息 id -> 被 ack 的次数（测试断言用）
    ack_counts: DashMap<String, usize>,
    nacked_total: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置管理端返回的消费分配
    pub fn set_assigned_ranges(&self, affinity: PartitionAffinity) {
        *self.affinity.write().expect("affinity lock poisoned") = affinity;
    }

    /// 投递一条消息到其主题队列
    pub fn publish(&self, message: Message) {
        self.queues
            .entry(message.topic().to_string())
            .or_default()
            .push_back(message);
    }

    pub fn publish_all(&self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.publish(message);
        }
    }

    /// 尚未出队的消息总量
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    /// 某条消息被 ack 的次数
    pub fn ack_count(&self, message_id: &str) -> usize {
        self.ack_counts
            .get(message_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn nacked_total(&self) -> usize {
        self.nacked_total.load(Ordering::Relaxed)
    }

    fn drain(&self, max_messages: usize) -> Vec<Message> {
        let mut out = Vec::new();
        // 主题名排序保证轮询顺序确定
        let mut topics: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        topics.sort();

        for topic in topics {
            if out.len() == max_messages {
                break;
            }
            if let Some(mut queue) = self.queues.get_mut(&topic) {
                while out.len() < max_messages {
                    match queue.pop_front() {
                        Some(message) => out.push(message),
                        None => break,
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryBroker {
    async fn init(&self, topics: &[String]) -> EngineResult<()> {
        for topic in topics {
            self.queues.entry(topic.clone()).or_default();
        }
        Ok(())
    }

    async fn next_batch(
        &self,
        max_messages: usize,
        poll_timeout: Duration,
    ) -> EngineResult<Vec<Message>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let deadline = time::Instant::now() + poll_timeout;
        loop {
            let batch = self.drain(max_messages);
            if !batch.is_empty() || time::Instant::now() >= deadline {
                return Ok(batch);
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
    ) -> EngineResult<()> {
        for ctx in acks {
            *self
                .ack_counts
                .entry(ctx.message_id().to_string())
                .or_insert(0) += 1;
        }

        self.nacked_total.fetch_add(nacks.len(), Ordering::Relaxed);
        // 逆序回插队首，保持 nack 消息之间原有的相对顺序
        for ctx in nacks.iter().rev() {
            if let Some(mut queue) = self.queues.get_mut(ctx.topic()) {
                queue.push_front(ctx.message().clone());
            } else {
                self.queues
                    .entry(ctx.topic().to_string())
                    .or_default()
                    .push_front(ctx.message().clone());
            }
        }
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn assigned_ranges(&self, _subscription: &str) -> EngineResult<PartitionAffinity> {
        Ok(self.affinity.read().expect("affinity lock poisoned").clone())
    }

    async fn require_topic(&self, topic: &str) -> EngineResult<()> {
        self.queues.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> EngineResult<()> {
        self.queues.remove(topic);
        Ok(())
    }
}
