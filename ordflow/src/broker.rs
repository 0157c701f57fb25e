//! broker 抽象（BrokerConsumer / BrokerAdmin）
//!
//! 引擎对消息系统的唯一依赖面。连接管理、线协议与游标存储均在实现侧，
//! 引擎只负责拉批、收敛处置与消费分配的本地视图。
//!
//! 处置语义：
//! - ack：提交游标，消息不再投递；
//! - nack：保持游标不前进，消息由 broker 在后续 `next_batch` 中重投，
//!   且同一分区键内保持与其他未 ack 消息的相对顺序。
//!
use crate::affinity::PartitionAffinity;
use crate::error::EngineResult;
use crate::message::{Message, MessageContext};
use async_trait::async_trait;
use std::time::Duration;

/// broker 消费端：批量拉取与批次收敛
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// 初始化消费端（声明订阅的主题集合）
    async fn init(&self, topics: &[String]) -> EngineResult<()>;

    /// 拉取最多 `max_messages` 条消息，最长等待 `poll_timeout`
    async fn next_batch(
        &self,
        max_messages: usize,
        poll_timeout: Duration,
    ) -> EngineResult<Vec<Message>>;

    /// 提交一批消息的最终处置
    async fn finalize_batch(
        &self,
        acks: &[MessageContext],
        nacks: &[MessageContext],
    ) -> EngineResult<()>;

    /// 释放消费端资源
    async fn close(&self) -> EngineResult<()>;
}

/// broker 管理端：消费分配查询与主题管理
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// 查询某订阅当前被分配的键哈希区间
    async fn assigned_ranges(&self, subscription: &str) -> EngineResult<PartitionAffinity>;

    /// 确保主题存在（不存在则创建）
    async fn require_topic(&self, topic: &str) -> EngineResult<()>;

    /// 删除主题
    async fn delete_topic(&self, topic: &str) -> EngineResult<()>;
}
