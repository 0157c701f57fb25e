//! 订阅批处理循环（Subscription）
//!
//! 编排“拉批 → 合并重投 → 处理器调用 → 批次收敛”的长驻任务：
//! - 从 broker 拉取一批消息，并按剩余容量合并失败策略的待重投消息
//!   （重投消息排在新消息之前）；
//! - 阻塞键的新消息在进入处理器之前被立即 nack；
//! - 应用处理器对每个批次恰好调用一次，崩溃视为 nack 全部未决消息；
//! - 收敛时先更新失败策略（确定哪些 nack 被接管），再向 broker 提交
//!   处置；出现 nack 后按退避策略等待再进入下一轮；
//! - 取消信号在循环顶部观察，进行中的调用/收敛允许完成；
//! - broker 故障只记录日志并退避重试，除非已请求停止。
//!
//! 单个订阅实例内部不并行处理同一批次，这是键内保序可行的前提；
//! 多个订阅实例（同一 broker 订阅的不同分片）彼此独立运行。
//!
use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::broker::{BrokerAdmin, BrokerConsumer};
use crate::error::{EngineError, EngineResult};
use crate::failure::{BacklogStrategy, FailureStrategy, OptOutStrategy, OrderedStrategy};
use crate::handler::BatchHandler;
use crate::message::{BatchContext, Disposition, MessageContext};
use bon::Builder;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 订阅配置
#[derive(Clone, Builder)]
pub struct SubscriptionConfig {
    /// 订阅名称（broker 侧标识，也用于日志）
    name: String,
    /// 订阅的主题列表
    topics: Vec<String>,
    /// 单批最大消息数
    #[builder(default = 100)]
    batch_size: usize,
    /// 单次拉批的最长等待
    #[builder(default = Duration::from_secs(1))]
    poll_timeout: Duration,
    /// 是否重投失败消息（false 时选用放弃重投策略）
    #[builder(default = true)]
    redeliver_failed: bool,
    /// 失败时是否保证键内顺序（true 选保序策略，false 选积压策略）
    #[builder(default = false)]
    guarantee_order: bool,
    /// 批间退避策略
    #[builder(default = Arc::new(ExponentialBackoff::default()))]
    backoff: Arc<dyn BackoffStrategy>,
    /// 消费分配的刷新间隔（仅保序模式使用）
    #[builder(default = Duration::from_secs(30))]
    affinity_refresh: Duration,
}

impl SubscriptionConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn redeliver_failed(&self) -> bool {
        self.redeliver_failed
    }

    pub fn guarantee_order(&self) -> bool {
        self.guarantee_order
    }

    fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() {
            return Err(EngineError::invalid_config("subscription name is required"));
        }
        if self.topics.is_empty() {
            return Err(EngineError::invalid_config(
                "subscription requires at least one topic",
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::invalid_config("batch size must be > 0"));
        }
        if self.guarantee_order && !self.redeliver_failed {
            return Err(EngineError::invalid_config(
                "guarantee_order requires redeliver_failed: ordering cannot be preserved \
                 while dropping failed messages",
            ));
        }
        Ok(())
    }
}

/// 订阅实例：一条顺序执行的拉批/调用/收敛循环
pub struct Subscription {
    config: SubscriptionConfig,
    consumer: Arc<dyn BrokerConsumer>,
    admin: Option<Arc<dyn BrokerAdmin>>,
    handler: Arc<dyn BatchHandler>,
    strategy: Arc<dyn FailureStrategy>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// 构造订阅；配置校验与失败策略选择都在此处 fail-fast
    pub fn new(
        config: SubscriptionConfig,
        consumer: Arc<dyn BrokerConsumer>,
        admin: Option<Arc<dyn BrokerAdmin>>,
        handler: Arc<dyn BatchHandler>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let strategy: Arc<dyn FailureStrategy> = if !config.redeliver_failed {
            Arc::new(OptOutStrategy)
        } else if config.guarantee_order {
            Arc::new(OrderedStrategy::default())
        } else {
            Arc::new(BacklogStrategy::new(&config.topics))
        };

        Ok(Self {
            config,
            consumer,
            admin,
            handler,
            strategy,
        })
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// 当前生效的失败策略（宿主可用于指标上报，内部容器并发安全）
    pub fn strategy(&self) -> &Arc<dyn FailureStrategy> {
        &self.strategy
    }

    /// 启动循环任务，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> SubscriptionHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));
        SubscriptionHandle { token, task: Some(task) }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        // Starting：初始化消费端，失败则退避重试直至成功或取消
        let mut broker_errors: u32 = 0;
        loop {
            let init = tokio::select! {
                _ = token.cancelled() => return,
                res = self.prepare() => res,
            };
            match init {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        subscription = %self.config.name,
                        error = %err,
                        "broker init failed, retrying"
                    );
                    broker_errors += 1;
                    let delay = self.config.backoff.next_interval(broker_errors - 1);
                    if !self.wait(&token, delay).await {
                        return;
                    }
                }
            }
        }

        self.refresh_affinity().await;
        let mut last_refresh = Instant::now();
        broker_errors = 0;

        info!(
            subscription = %self.config.name,
            topics = ?self.config.topics,
            "subscription started"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            if self.config.guarantee_order
                && last_refresh.elapsed() >= self.config.affinity_refresh
            {
                self.refresh_affinity().await;
                last_refresh = Instant::now();
            }

            // Polling
            let polled = tokio::select! {
                _ = token.cancelled() => break,
                res = self.poll_batch() => res,
            };
            let (mut batch, auto_nacked) = match polled {
                Ok(polled) => polled,
                Err(err) => {
                    broker_errors += 1;
                    warn!(
                        subscription = %self.config.name,
                        error = %err,
                        consecutive = broker_errors,
                        "poll failed"
                    );
                    let delay = self.config.backoff.next_interval(broker_errors - 1);
                    if !self.wait(&token, delay).await {
                        break;
                    }
                    continue;
                }
            };
            broker_errors = 0;

            if batch.is_empty() && auto_nacked.is_empty() {
                // 空轮询；poll_timeout 已经限制了等待，直接进入下一轮
                continue;
            }

            // Invoking：处理器恰好调用一次；崩溃时未决消息一律 nack
            let default = if batch.is_empty() {
                Disposition::Ack
            } else {
                match self.handler.on_batch(&mut batch).await {
                    Ok(()) => Disposition::Ack,
                    Err(err) => {
                        warn!(
                            subscription = %self.config.name,
                            handler = self.handler.handler_name(),
                            error = %err,
                            "batch handler failed, nacking undecided messages"
                        );
                        Disposition::Nack
                    }
                }
            };
            batch.settle_undecided(default);

            // Finalizing：先更新失败策略，再向 broker 提交处置
            let (mut acks, mut nacks) = batch.into_dispositions();
            nacks.extend(auto_nacked);
            let had_nacks = !nacks.is_empty();

            let high_water = Self::high_water_marks(&acks, &nacks);
            let retained = match self.strategy.finalize_batch(&acks, &nacks, &high_water) {
                Ok(retained) => retained.into_iter().collect::<HashSet<_>>(),
                Err(err) => {
                    // acks/nacks 由同一批次互斥拆分而来，契约违规属引擎缺陷
                    error!(
                        subscription = %self.config.name,
                        error = %err,
                        "failure strategy rejected batch finalization"
                    );
                    HashSet::new()
                }
            };

            // 被策略接管（或放弃）的 nack 对 broker 以 ack 收尾，
            // 其余 nack 留给 broker 保持游标并重投
            let (owned, broker_nacks): (Vec<MessageContext>, Vec<MessageContext>) = nacks
                .into_iter()
                .partition(|ctx| retained.contains(ctx.message_id()));
            acks.extend(owned);

            if let Err(err) = self.consumer.finalize_batch(&acks, &broker_nacks).await {
                warn!(
                    subscription = %self.config.name,
                    error = %err,
                    "broker finalize failed, broker will redeliver unacked messages"
                );
            }

            if had_nacks {
                let delay = self
                    .config
                    .backoff
                    .next_interval(self.strategy.retry_attempts());
                if !self.wait(&token, delay).await {
                    break;
                }
            }
        }

        // Stopped：释放消费端资源
        if let Err(err) = self.consumer.close().await {
            warn!(subscription = %self.config.name, error = %err, "consumer close failed");
        }
        info!(subscription = %self.config.name, "subscription stopped");
    }

    /// 确保主题存在（有 admin 时），再初始化消费端
    async fn prepare(&self) -> EngineResult<()> {
        if let Some(admin) = &self.admin {
            for topic in &self.config.topics {
                admin.require_topic(topic).await?;
            }
        }
        self.consumer.init(&self.config.topics).await
    }

    /// 拉取并组装下一批：重投消息优先占用容量，剩余容量给新消息
    async fn poll_batch(&self) -> EngineResult<(BatchContext, Vec<MessageContext>)> {
        let batch_id = Uuid::new_v4();

        let mut deliverable: Vec<MessageContext> = self
            .strategy
            .messages_for_retry(self.config.batch_size)
            .into_iter()
            .map(|ctx| ctx.for_redelivery(batch_id))
            .collect();

        let remaining = self.config.batch_size - deliverable.len();
        let fresh = if remaining == 0 {
            Vec::new()
        } else {
            match self
                .consumer
                .next_batch(remaining, self.config.poll_timeout)
                .await
            {
                Ok(fresh) => fresh,
                // 已从失败策略取出的重投消息不能丢：broker 故障时
                // 退化为纯重投批次，新消息留待下一轮
                Err(err) if !deliverable.is_empty() => {
                    warn!(
                        subscription = %self.config.name,
                        error = %err,
                        "poll failed, proceeding with retry-only batch"
                    );
                    Vec::new()
                }
                Err(err) => return Err(err),
            }
        };

        let mut auto_nacked = Vec::new();
        for message in fresh {
            let mut ctx = MessageContext::new(Arc::new(message), batch_id);
            if self.strategy.in_normal_mode(ctx.topic(), ctx.partition_key()) {
                deliverable.push(ctx);
            } else {
                // 阻塞键的新消息不进处理器，立即 nack 以免游标越过失败点
                ctx.nack();
                auto_nacked.push(ctx);
            }
        }

        Ok((BatchContext::new(batch_id, deliverable), auto_nacked))
    }

    async fn refresh_affinity(&self) {
        if !self.config.guarantee_order {
            return;
        }
        let Some(admin) = &self.admin else {
            return;
        };
        match admin.assigned_ranges(&self.config.name).await {
            Ok(affinity) => self.strategy.apply_affinity(affinity),
            Err(err) => {
                warn!(
                    subscription = %self.config.name,
                    error = %err,
                    "failed to refresh partition assignment"
                );
            }
        }
    }

    /// 可取消等待；返回 false 表示等待期间收到停止信号
    async fn wait(&self, token: &CancellationToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return !token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    /// 本批次内每个主题观察到的最大序列号
    fn high_water_marks(
        acks: &[MessageContext],
        nacks: &[MessageContext],
    ) -> HashMap<String, u64> {
        let mut marks = HashMap::new();
        for ctx in acks.iter().chain(nacks) {
            marks
                .entry(ctx.topic().to_string())
                .and_modify(|seq: &mut u64| *seq = (*seq).max(ctx.message().sequence_id()))
                .or_insert(ctx.message().sequence_id());
        }
        marks
    }
}

/// 订阅运行句柄：优雅关闭与等待
pub struct SubscriptionHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// 请求停止；进行中的批次允许完成
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 等待循环任务退出
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn mk_message(topic: &str, key: &str, seq: u64) -> Message {
        Message::builder()
            .message_id(format!("{topic}/{key}/{seq}"))
            .topic(topic.to_string())
            .partition_key(key.to_string())
            .sequence_id(seq)
            .published_at(Utc::now())
            .payload(serde_json::json!({ "seq": seq }))
            .build()
    }

    /// 按脚本吐批次的 broker 假实现
    #[derive(Default)]
    struct ScriptedBroker {
        batches: Mutex<VecDeque<Vec<Message>>>,
        acked: Mutex<Vec<String>>,
        nacked: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl ScriptedBroker {
        fn with_batches(batches: Vec<Vec<Message>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                ..Default::default()
            })
        }

        fn acked_ids(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }

        fn nacked_ids(&self) -> Vec<String> {
            self.nacked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerConsumer for ScriptedBroker {
        async fn init(&self, _topics: &[String]) -> EngineResult<()> {
            Ok(())
        }

        async fn next_batch(
            &self,
            _max_messages: usize,
            _poll_timeout: Duration,
        ) -> EngineResult<Vec<Message>> {
            // 脚本耗尽后返回空批，避免循环空转过快
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => Ok(batch),
                None => {
                    time::sleep(Duration::from_millis(5)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn finalize_batch(
            &self,
            acks: &[MessageContext],
            nacks: &[MessageContext],
        ) -> EngineResult<()> {
            let mut acked = self.acked.lock().unwrap();
            acked.extend(acks.iter().map(|ctx| ctx.message_id().to_string()));
            let mut nacked = self.nacked.lock().unwrap();
            nacked.extend(nacks.iter().map(|ctx| ctx.message_id().to_string()));
            Ok(())
        }

        async fn close(&self) -> EngineResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// 记录投递序列、按脚本 nack 的处理器
    struct SpyHandler {
        seen: Mutex<Vec<String>>,
        nack_ids: Vec<String>,
        crash: AtomicBool,
        invocations: AtomicUsize,
    }

    impl SpyHandler {
        fn new(nack_ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                nack_ids: nack_ids.iter().map(|id| id.to_string()).collect(),
                crash: AtomicBool::new(false),
                invocations: AtomicUsize::new(0),
            })
        }

        fn seen_ids(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchHandler for SpyHandler {
        fn handler_name(&self) -> &str {
            "spy"
        }

        async fn on_batch(&self, batch: &mut BatchContext) -> anyhow::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            for ctx in batch.iter_mut() {
                self.seen.lock().unwrap().push(ctx.message_id().to_string());
                if self.nack_ids.iter().any(|id| id == ctx.message_id()) {
                    ctx.nack();
                }
            }
            if self.crash.load(Ordering::SeqCst) {
                anyhow::bail!("crash requested");
            }
            Ok(())
        }
    }

    fn config(guarantee_order: bool) -> SubscriptionConfig {
        SubscriptionConfig::builder()
            .name("sub-test".to_string())
            .topics(vec!["orders".to_string()])
            .batch_size(10)
            .poll_timeout(Duration::from_millis(10))
            .guarantee_order(guarantee_order)
            .backoff(Arc::new(crate::backoff::ConstantBackoff::new(
                Duration::from_millis(1),
            )))
            .build()
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn construction_rejects_conflicting_settings() {
        let broker = ScriptedBroker::with_batches(vec![]);
        let handler = SpyHandler::new(&[]);

        let config = SubscriptionConfig::builder()
            .name("sub".to_string())
            .topics(vec!["orders".to_string()])
            .redeliver_failed(false)
            .guarantee_order(true)
            .build();
        let err = Subscription::new(config, broker.clone(), None, handler.clone()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));

        let empty_topics = SubscriptionConfig::builder()
            .name("sub".to_string())
            .topics(Vec::new())
            .build();
        assert!(Subscription::new(empty_topics, broker, None, handler).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_key_messages_never_reach_handler() {
        let broker = ScriptedBroker::with_batches(vec![
            vec![mk_message("orders", "k1", 1)],
            vec![mk_message("orders", "k1", 2)],
        ]);
        let handler = SpyHandler::new(&["orders/k1/1"]);

        let subscription = Arc::new(
            Subscription::new(config(true), broker.clone(), None, handler.clone()).unwrap(),
        );
        let strategy = subscription.strategy().clone();
        let handle = subscription.start();

        // seq=2 在 k1 阻塞期间到达，必须被自动 nack 而不进入处理器
        eventually(|| broker.nacked_ids().contains(&"orders/k1/2".to_string())).await;
        handle.shutdown();
        handle.join().await;

        assert!(!handler.seen_ids().contains(&"orders/k1/2".to_string()));
        assert!(!strategy.in_normal_mode("orders", "k1"));
        assert!(broker.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nacked_message_is_redelivered_until_acked() {
        let broker =
            ScriptedBroker::with_batches(vec![vec![mk_message("orders", "k1", 1)]]);
        // 只在第一次投递时 nack：重投时 id 相同，但 SpyHandler 的
        // nack 脚本只认首个出现，因此这里手工控制
        struct OnceNack {
            seen: Mutex<Vec<String>>,
            nacked_once: AtomicBool,
        }
        #[async_trait]
        impl BatchHandler for OnceNack {
            fn handler_name(&self) -> &str {
                "once-nack"
            }
            async fn on_batch(&self, batch: &mut BatchContext) -> anyhow::Result<()> {
                for ctx in batch.iter_mut() {
                    self.seen.lock().unwrap().push(ctx.message_id().to_string());
                    if !self.nacked_once.swap(true, Ordering::SeqCst) {
                        ctx.nack();
                    }
                }
                Ok(())
            }
        }
        let handler = Arc::new(OnceNack {
            seen: Mutex::new(Vec::new()),
            nacked_once: AtomicBool::new(false),
        });

        let subscription = Arc::new(
            Subscription::new(config(true), broker.clone(), None, handler.clone()).unwrap(),
        );
        let handle = subscription.start();

        // 首次投递 nack，重投后 ack
        eventually(|| broker.acked_ids().iter().filter(|id| *id == "orders/k1/1").count() >= 2)
            .await;
        handle.shutdown();
        handle.join().await;

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["orders/k1/1".to_string(), "orders/k1/1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_crash_nacks_undecided_messages() {
        let broker = ScriptedBroker::with_batches(vec![vec![
            mk_message("orders", "k1", 1),
            mk_message("orders", "k2", 1),
        ]]);
        let handler = SpyHandler::new(&[]);
        handler.crash.store(true, Ordering::SeqCst);

        let subscription = Arc::new(
            Subscription::new(config(false), broker.clone(), None, handler.clone()).unwrap(),
        );
        let handle = subscription.start();

        // 崩溃批次的两条消息都被 nack、由积压策略接管
        eventually(|| broker.acked_ids().len() >= 2).await;
        handle.shutdown();
        handle.join().await;

        // 积压策略接管 nack：broker 侧以 ack 收尾，消息由引擎自行重投
        assert!(broker.nacked_ids().is_empty());
        assert!(handler.invocations.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backlogged_messages_are_merged_before_fresh() {
        let broker = ScriptedBroker::with_batches(vec![
            vec![mk_message("orders", "k1", 1)],
            vec![mk_message("orders", "k2", 1)],
        ]);
        let handler = SpyHandler::new(&["orders/k1/1"]);

        let subscription = Arc::new(
            Subscription::new(config(false), broker.clone(), None, handler.clone()).unwrap(),
        );
        let handle = subscription.start();

        eventually(|| handler.seen_ids().len() >= 3).await;
        handle.shutdown();
        handle.join().await;

        // 第二批中，重投的 k1 消息排在新消息 k2 之前；k1 被脚本持续
        // nack，停机前可能又追加了几次重投，只校验前三条
        let seen = handler.seen_ids();
        assert_eq!(
            &seen[..3],
            &[
                "orders/k1/1".to_string(),
                "orders/k1/1".to_string(),
                "orders/k2/1".to_string(),
            ]
        );
        assert_eq!(seen.iter().filter(|id| *id == "orders/k2/1").count(), 1);
    }
}
