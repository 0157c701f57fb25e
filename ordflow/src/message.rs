//! 消息模型（Message / MessageContext / BatchContext）
//!
//! 定义不可变的消息单元及其在一次批处理生命周期中的记账状态：
//! - `Message`：生产侧产出的只读消息（主题、分区键、序列号、负载）；
//! - `MessageContext`：消息加上所属批次与 ack/nack 处置状态；
//! - `BatchContext`：交给应用处理器的合并批次，ack/nack 的标记入口。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// 不可变消息单元，由生产侧构建，引擎只读消费
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct Message {
    /// 消息唯一标识符
    message_id: String,
    /// 所属主题
    topic: String,
    /// 分区键（stream id），同键消息必须保序
    partition_key: String,
    /// 分区键内单调递增的序列号，由生产侧赋值
    sequence_id: u64,
    /// 消息发布时间
    published_at: DateTime<Utc>,
    /// 消息负载（不透明数据）
    payload: Value,
    /// broker 侧 ack/nack 所需的投递元数据（对引擎不透明）
    #[builder(default)]
    delivery_metadata: Value,
}

impl Message {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn delivery_metadata(&self) -> &Value {
        &self.delivery_metadata
    }

    /// (topic, partition_key) 组合键
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            topic: self.topic.clone(),
            partition_key: self.partition_key.clone(),
        }
    }
}

/// (topic, partition_key) 组合键，用于索引按流划分的失败状态
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    topic: String,
    partition_key: String,
}

impl StreamKey {
    pub fn new(topic: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition_key: partition_key.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }
}

/// 消息在一次批处理中的处置状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// 消息加引擎侧记账：所属批次与当前处置
///
/// 处置初始为未决（undecided）；处理器返回后，未决消息按默认处置收敛
/// （正常返回默认 ack，处理器崩溃默认 nack）。
#[derive(Debug, Clone)]
pub struct MessageContext {
    message: Arc<Message>,
    batch_id: Uuid,
    disposition: Option<Disposition>,
}

impl MessageContext {
    pub(crate) fn new(message: Arc<Message>, batch_id: Uuid) -> Self {
        Self {
            message,
            batch_id,
            disposition: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn partition_key(&self) -> &str {
        self.message.partition_key()
    }

    pub fn message_id(&self) -> &str {
        self.message.message_id()
    }

    pub fn stream_key(&self) -> StreamKey {
        self.message.stream_key()
    }

    /// 标记为成功处理
    pub fn ack(&mut self) {
        self.disposition = Some(Disposition::Ack);
    }

    /// 标记为处理失败，交由失败策略决定是否重投
    pub fn nack(&mut self) {
        self.disposition = Some(Disposition::Nack);
    }

    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    pub fn is_nacked(&self) -> bool {
        self.disposition == Some(Disposition::Nack)
    }

    /// 以全新未决状态重新投递到指定批次（失败策略重试时使用）
    pub(crate) fn for_redelivery(&self, batch_id: Uuid) -> Self {
        Self {
            message: Arc::clone(&self.message),
            batch_id,
            disposition: None,
        }
    }
}

/// 交给应用处理器的合并批次
///
/// 处理器通过 `iter_mut` 遍历并对单条消息 ack/nack；未显式标记的消息
/// 在批次收敛时按默认处置处理。
#[derive(Debug)]
pub struct BatchContext {
    batch_id: Uuid,
    messages: Vec<MessageContext>,
}

impl BatchContext {
    pub(crate) fn new(batch_id: Uuid, messages: Vec<MessageContext>) -> Self {
        Self { batch_id, messages }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageContext> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MessageContext> {
        self.messages.iter_mut()
    }

    /// 将所有未决消息收敛为给定处置
    pub(crate) fn settle_undecided(&mut self, default: Disposition) {
        for ctx in &mut self.messages {
            if ctx.disposition.is_none() {
                ctx.disposition = Some(default);
            }
        }
    }

    /// 按处置拆分为 (acks, nacks)；调用前必须已收敛所有未决消息
    pub(crate) fn into_dispositions(self) -> (Vec<MessageContext>, Vec<MessageContext>) {
        self.messages
            .into_iter()
            .partition(|ctx| !ctx.is_nacked())
    }
}
