//! 失败恢复策略（FailureStrategy）
//!
//! 决定一个收敛完成的批次中，哪些被 nack 的消息在何时重新投递，
//! 以及某个分区键何时可以恢复正常投递。三种策略：
//! - `OptOutStrategy`：放弃重投，nack 即永久丢弃（at-most-once）；
//! - `BacklogStrategy`：按主题 FIFO 积压重投，不保证跨流顺序但绝不丢失；
//! - `OrderedStrategy`：阻塞失败键，仅重投队首失败消息，保证键内保序。
//!
//! 所有策略状态仅由所属订阅的循环任务写入；宿主如需跨线程读取
//! （如指标上报），内部容器均为并发安全。
//!
use crate::affinity::PartitionAffinity;
use crate::error::{EngineError, EngineResult};
use crate::message::MessageContext;
use std::collections::{HashMap, HashSet};

pub mod backlog;
pub mod opt_out;
pub mod ordered;

pub use backlog::BacklogStrategy;
pub use opt_out::OptOutStrategy;
pub use ordered::OrderedStrategy;

/// 失败恢复策略：批次收敛后的重投决策
pub trait FailureStrategy: Send + Sync {
    /// 某个分区键当前是否处于正常投递模式
    ///
    /// 返回 `false` 时，该键的任何*新*消息都不得进入应用处理器，
    /// 调用方应立即 nack，使 broker 不越过失败点推进该键的游标。
    fn in_normal_mode(&self, topic: &str, partition_key: &str) -> bool;

    /// 取出至多 `capacity` 条待重投消息；`capacity == 0` 返回空且无副作用
    fn messages_for_retry(&self, capacity: usize) -> Vec<MessageContext>;

    /// 用一个批次的最终处置更新重投/积压/失败模式状态
    ///
    /// `high_water_marks` 为本批次内每个主题观察到的最大序列号。
    /// 返回策略已接管（将自行重投）或明确放弃的消息 id：这些消息
    /// 对 broker 以 ack 收尾，其余 nack 留给 broker 重投。
    ///
    /// 同一消息同时出现在 `acks` 与 `nacks` 属调用方契约违规。
    fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
        high_water_marks: &HashMap<String, u64>,
    ) -> EngineResult<Vec<String>>;

    /// 当前被跟踪失败中的最大重试次数（驱动批间退避）
    fn retry_attempts(&self) -> u32;

    /// 应用新的消费分配（仅对按键阻塞的策略有意义）
    fn apply_affinity(&self, _affinity: PartitionAffinity) {}
}

/// 校验 acks 与 nacks 两个集合互不相交
pub(crate) fn ensure_disjoint(
    acks: &[MessageContext],
    nacks: &[MessageContext],
) -> EngineResult<()> {
    if acks.is_empty() || nacks.is_empty() {
        return Ok(());
    }
    let acked: HashSet<&str> = acks.iter().map(|ctx| ctx.message_id()).collect();
    if let Some(dup) = nacks.iter().find(|ctx| acked.contains(ctx.message_id())) {
        return Err(EngineError::contract(format!(
            "message present in both acks and nacks: {}",
            dup.message_id()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::message::{Message, MessageContext};
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    /// 测试用消息上下文
    pub fn mk_context(topic: &str, key: &str, seq: u64) -> MessageContext {
        let message = Message::builder()
            .message_id(format!("{topic}/{key}/{seq}"))
            .topic(topic.to_string())
            .partition_key(key.to_string())
            .sequence_id(seq)
            .published_at(Utc::now())
            .payload(serde_json::json!({ "seq": seq }))
            .build();
        MessageContext::new(Arc::new(message), Uuid::new_v4())
    }

    pub fn nacked(topic: &str, key: &str, seq: u64) -> MessageContext {
        let mut ctx = mk_context(topic, key, seq);
        ctx.nack();
        ctx
    }

    pub fn acked(topic: &str, key: &str, seq: u64) -> MessageContext {
        let mut ctx = mk_context(topic, key, seq);
        ctx.ack();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{acked, nacked};
    use super::*;

    #[test]
    fn disjoint_check_rejects_overlap() {
        let a = acked("orders", "k1", 1);
        let mut dup = a.clone();
        dup.nack();

        let err = ensure_disjoint(&[a], &[dup]).unwrap_err();
        assert!(matches!(err, EngineError::Contract { .. }));
    }

    #[test]
    fn disjoint_check_accepts_distinct_sets() {
        let a = acked("orders", "k1", 1);
        let n = nacked("orders", "k2", 1);
        assert!(ensure_disjoint(&[a], &[n]).is_ok());
        assert!(ensure_disjoint(&[], &[]).is_ok());
    }
}
