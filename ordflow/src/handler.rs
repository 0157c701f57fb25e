//! 应用批处理器（BatchHandler）
//!
//! 定义应用侧消费合并批次的处理入口与默认处置约定。
//!
use crate::message::BatchContext;
use async_trait::async_trait;

/// 应用批处理器：每个批次恰好被调用一次
///
/// 处理器通过 `batch.iter_mut()` 对单条消息 ack/nack；未显式标记的消息
/// 默认按 ack 处理。返回 `Err` 视为处理器崩溃：批次内所有仍未决的消息
/// 一律按 nack 收敛（已显式标记的处置保留）。
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// 处理器名称（用于日志与失败归因）
    fn handler_name(&self) -> &str;

    /// 处理一个合并批次
    async fn on_batch(&self, batch: &mut BatchContext) -> anyhow::Result<()>;
}
