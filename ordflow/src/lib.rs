//! 有序批订阅与失败恢复引擎（ordflow）
//!
//! 提供存储无关、broker 无关的批订阅消费抽象：从 broker 抽象拉取
//! 有序消息批次，交给应用处理器，并在部分消息失败（nack）时决定
//! 重投哪些消息、以什么顺序、配合何种退避——同时保证同一分区键的
//! 消息绝不乱序进入消费方。
//!
//! 核心构件：
//! - 退避策略（`backoff`）：重试次数到等待时长的纯函数；
//! - 键哈希区间（`affinity`）：key-shared 分配的本地视图与归属判断；
//! - 失败策略（`failure`）：放弃重投 / 积压重投 / 保序重投三种变体；
//! - 订阅循环（`subscription`）：拉批、合并重投、调用处理器、收敛处置；
//! - broker 抽象（`broker`）与内存实现（`broker_inmemory`）。
//!
//! 本 crate 不实现 broker 客户端、持久化存储与分布式分配协调，
//! 只消费 broker 给出的分配结果。典型用法：
//! 1. 实现或接入 `BrokerConsumer`（及可选的 `BrokerAdmin`）；
//! 2. 实现 `BatchHandler`，在批上下文中对单条消息 ack/nack；
//! 3. 用 `SubscriptionConfig` 选择失败策略与退避参数；
//! 4. `Subscription::start` 启动循环，经 `SubscriptionHandle` 优雅关闭。
//!
pub mod affinity;
pub mod backoff;
pub mod broker;
pub mod broker_inmemory;
pub mod error;
pub mod failure;
pub mod handler;
pub mod message;
pub mod subscription;

pub use affinity::{HASH_SPACE_SIZE, HashRange, PartitionAffinity, key_hash};
pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff};
pub use broker::{BrokerAdmin, BrokerConsumer};
pub use broker_inmemory::InMemoryBroker;
pub use error::{EngineError, EngineResult};
pub use failure::{BacklogStrategy, FailureStrategy, OptOutStrategy, OrderedStrategy};
pub use handler::BatchHandler;
pub use message::{BatchContext, Disposition, Message, MessageContext, StreamKey};
pub use subscription::{Subscription, SubscriptionConfig, SubscriptionHandle};
