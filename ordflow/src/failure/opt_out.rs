//! 放弃重投策略（OptOutStrategy）
//!
//! 应用显式放弃重试：nack 的消息被永久丢弃（对 broker 按 ack 收尾，
//! 游标照常推进），引擎在该模式下提供 at-most-once 语义。适用于
//! 处理器自身幂等/尽力而为、重投没有价值的场景。
//!
use super::{FailureStrategy, ensure_disjoint};
use crate::error::EngineResult;
use crate::message::MessageContext;
use std::collections::HashMap;
use tracing::debug;

/// 放弃重投：所有键始终正常投递，nack 即丢弃
#[derive(Debug, Default, Clone, Copy)]
pub struct OptOutStrategy;

impl FailureStrategy for OptOutStrategy {
    fn in_normal_mode(&self, _topic: &str, _partition_key: &str) -> bool {
        true
    }

    fn messages_for_retry(&self, _capacity: usize) -> Vec<MessageContext> {
        Vec::new()
    }

    fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
        _high_water_marks: &HashMap<String, u64>,
    ) -> EngineResult<Vec<String>> {
        ensure_disjoint(acks, nacks)?;

        if !nacks.is_empty() {
            debug!(dropped = nacks.len(), "opt-out strategy dropping nacked messages");
        }
        // 全部接管即丢弃：broker 游标推进，消息不再出现
        Ok(nacks.iter().map(|ctx| ctx.message_id().to_string()).collect())
    }

    fn retry_attempts(&self) -> u32 {
        0
    }
}
