//! 保序重投策略（OrderedStrategy）
//!
//! 失败模式登记表：某分区键首次失败后进入阻塞态，仅保留并重投该键的
//! 队首失败消息；阻塞期间该键的新消息一律立即 nack（不计入重试次数），
//! 使 broker 不越过失败点推进游标。队首消息最终 ack 后解除阻塞，
//! 恢复正常投递。
//!
//! 这是唯一满足以下性质的策略：对每个分区键，应用处理器观察到的
//! 序列号序列单调不减，即使跨越多次重投。
//!
//! 失败状态以 `PartitionAffinity` 为作用域：消费分配变化时，不再归属
//! 本实例的键的阻塞状态被清除。
//!
use super::{FailureStrategy, ensure_disjoint};
use crate::affinity::PartitionAffinity;
use crate::error::EngineResult;
use crate::message::{MessageContext, StreamKey};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, trace, warn};

/// 按键阻塞的保序重投策略
pub struct OrderedStrategy {
    /// 阻塞键 -> 该键待重投的队首失败消息
    pending: DashMap<StreamKey, MessageContext>,
    attempts: DashMap<StreamKey, u32>,
    affinity: RwLock<PartitionAffinity>,
}

impl Default for OrderedStrategy {
    fn default() -> Self {
        Self::new(PartitionAffinity::all())
    }
}

impl OrderedStrategy {
    pub fn new(affinity: PartitionAffinity) -> Self {
        Self {
            pending: DashMap::new(),
            attempts: DashMap::new(),
            affinity: RwLock::new(affinity),
        }
    }

    /// 当前处于阻塞态的键数量
    pub fn blocked_keys(&self) -> usize {
        self.pending.len()
    }

    fn is_pending_head(&self, ctx: &MessageContext) -> bool {
        self.pending
            .get(&ctx.stream_key())
            .is_some_and(|head| head.message_id() == ctx.message_id())
    }
}

impl FailureStrategy for OrderedStrategy {
    fn in_normal_mode(&self, topic: &str, partition_key: &str) -> bool {
        !self
            .pending
            .contains_key(&StreamKey::new(topic, partition_key))
    }

    fn messages_for_retry(&self, capacity: usize) -> Vec<MessageContext> {
        if capacity == 0 {
            return Vec::new();
        }
        // 每个阻塞键恰好一条；排序保证容量受限时的取出顺序确定
        let mut retries: Vec<MessageContext> = self
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        retries.sort_by(|a, b| {
            (a.topic(), a.partition_key()).cmp(&(b.topic(), b.partition_key()))
        });
        retries.truncate(capacity);
        retries
    }

    fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
        _high_water_marks: &HashMap<String, u64>,
    ) -> EngineResult<Vec<String>> {
        ensure_disjoint(acks, nacks)?;

        // 先处理 nack 再处理 ack：同一批内“队首 ack 解除阻塞”之后
        // 到达的被自动 nack 的后续消息，不应被误认成新的失败
        let mut retained = Vec::new();
        for ctx in nacks {
            let key = ctx.stream_key();
            match self.pending.get(&key) {
                None => {
                    // 该键首次失败：进入阻塞态，保留队首消息
                    debug!(
                        topic = ctx.topic(),
                        partition_key = ctx.partition_key(),
                        message_id = ctx.message_id(),
                        "partition key entering failure mode"
                    );
                    self.attempts.insert(key.clone(), 0);
                    self.pending.insert(key, ctx.clone());
                    retained.push(ctx.message_id().to_string());
                }
                Some(head) if head.message_id() == ctx.message_id() => {
                    // 队首消息重试再次失败：计数递增，继续持有
                    drop(head);
                    if let Some(mut attempts) = self.attempts.get_mut(&key) {
                        *attempts += 1;
                    }
                    retained.push(ctx.message_id().to_string());
                }
                Some(_) => {
                    // 阻塞期间被立即 nack 的新消息：不接管、不计数，
                    // 留给 broker 在解除阻塞后按原序重投
                    trace!(
                        topic = ctx.topic(),
                        partition_key = ctx.partition_key(),
                        message_id = ctx.message_id(),
                        "nacking new message for blocked partition key"
                    );
                }
            }
        }

        for ctx in acks {
            if self.is_pending_head(ctx) {
                let key = ctx.stream_key();
                self.pending.remove(&key);
                self.attempts.remove(&key);
                debug!(
                    topic = ctx.topic(),
                    partition_key = ctx.partition_key(),
                    "partition key recovered, resuming normal delivery"
                );
            }
        }
        Ok(retained)
    }

    fn retry_attempts(&self) -> u32 {
        self.attempts
            .iter()
            .map(|entry| *entry.value())
            .max()
            .unwrap_or(0)
    }

    fn apply_affinity(&self, affinity: PartitionAffinity) {
        {
            let current = self.affinity.read().expect("affinity lock poisoned");
            if *current == affinity {
                return;
            }
        }

        // 分配发生变化：清除不再归属本实例的键的失败状态
        self.pending.retain(|key, _| {
            let keep = affinity.is_match(key.partition_key());
            if !keep {
                warn!(
                    topic = key.topic(),
                    partition_key = key.partition_key(),
                    "dropping failure state for reassigned partition key"
                );
            }
            keep
        });
        self.attempts
            .retain(|key, _| affinity.is_match(key.partition_key()));

        *self.affinity.write().expect("affinity lock poisoned") = affinity;
    }
}
