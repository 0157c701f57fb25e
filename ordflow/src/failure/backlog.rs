//! 积压重投策略（BacklogStrategy）
//!
//! 每个主题维护一个 FIFO 积压队列：批次收敛时所有 nack 入队，
//! 下次拉批时按配置的主题顺序出队填充容量。不保证跨流的全局顺序
//! （重投消息可能与其他流的新消息交错），但绝不丢失消息，也绝不
//! 重投已 ack 的消息。积压无上界，仅受内存限制。
//!
use super::{FailureStrategy, ensure_disjoint};
use crate::error::EngineResult;
use crate::message::{MessageContext, StreamKey};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// 按主题积压的 FIFO 重投策略
pub struct BacklogStrategy {
    /// 出队遍历的固定主题顺序（进程生命周期内稳定）
    topics: Vec<String>,
    backlogs: DashMap<String, VecDeque<MessageContext>>,
    attempts: DashMap<StreamKey, u32>,
}

impl BacklogStrategy {
    pub fn new(topics: &[String]) -> Self {
        let backlogs = DashMap::new();
        for topic in topics {
            backlogs.insert(topic.clone(), VecDeque::new());
        }
        Self {
            topics: topics.to_vec(),
            backlogs,
            attempts: DashMap::new(),
        }
    }

    /// 当前积压总量（跨所有主题）
    pub fn backlogged(&self) -> usize {
        self.backlogs.iter().map(|entry| entry.value().len()).sum()
    }
}

impl FailureStrategy for BacklogStrategy {
    fn in_normal_mode(&self, _topic: &str, _partition_key: &str) -> bool {
        // 积压模式不阻塞新消息投递
        true
    }

    fn messages_for_retry(&self, capacity: usize) -> Vec<MessageContext> {
        if capacity == 0 {
            return Vec::new();
        }
        let want = capacity.min(self.backlogged());
        let mut out = Vec::with_capacity(want);

        for topic in &self.topics {
            if out.len() == want {
                break;
            }
            if let Some(mut queue) = self.backlogs.get_mut(topic) {
                while out.len() < want {
                    match queue.pop_front() {
                        Some(ctx) => out.push(ctx),
                        None => break,
                    }
                }
            }
        }
        out
    }

    fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
        _high_water_marks: &HashMap<String, u64>,
    ) -> EngineResult<Vec<String>> {
        ensure_disjoint(acks, nacks)?;

        for ctx in acks {
            self.attempts.remove(&ctx.stream_key());
        }

        let mut retained = Vec::with_capacity(nacks.len());
        for ctx in nacks {
            self.attempts
                .entry(ctx.stream_key())
                .and_modify(|attempts| *attempts += 1)
                .or_insert(0);
            retained.push(ctx.message_id().to_string());
            trace!(
                topic = ctx.topic(),
                partition_key = ctx.partition_key(),
                message_id = ctx.message_id(),
                "backlogging nacked message"
            );
            self.backlogs
                .entry(ctx.topic().to_string())
                .or_default()
                .push_back(ctx.clone());
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
}
