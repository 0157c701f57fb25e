//! 重试退避策略（BackoffStrategy）
//!
//! 将重试次数映射为等待时长的纯函数：
//! - `ExponentialBackoff`：`min(base * 2^attempts * (1 ± jitter), max)`，
//!   抖动在封顶前施加；
//! - `ConstantBackoff`：固定时长，忽略次数。
//!
//! 策略自身不持有可变共享状态（抖动使用线程本地随机源），可在多个
//! 重试定时器间并发调用。
//!
use crate::error::{EngineError, EngineResult};
use rand::Rng;
use std::time::Duration;

/// 退避策略：重试次数 -> 等待时长
pub trait BackoffStrategy: Send + Sync {
    /// 第 `attempts` 次重试前应等待的时长（`attempts` 从 0 开始计）
    fn next_interval(&self, attempts: u32) -> Duration;
}

/// 指数退避，带封顶与均匀抖动
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

/// 默认参数：10ms 起步、10s 封顶、±15% 抖动
impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.15,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_interval(&self, attempts: u32) -> Duration {
        // f64 下 2 的幂精确，指数封顶避免溢出为 inf
        let exp = 2f64.powi(attempts.min(63) as i32);
        let mut delay = self.base_delay.as_secs_f64() * exp;

        if self.jitter_factor > 0.0 {
            let perturbation = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
            delay *= 1.0 + perturbation;
        }

        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// `ExponentialBackoff` 的构建器
///
/// 构建时校验：base 与 max 必须同时给定、`max >= base`、抖动因子位于
/// `0.0..=1.0`；不满足则在任何重试逻辑运行之前以配置错误失败。
#[derive(Debug, Default)]
pub struct ExponentialBackoffBuilder {
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter_factor: f64,
}

impl ExponentialBackoffBuilder {
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn build(self) -> EngineResult<ExponentialBackoff> {
        let base_delay = self
            .base_delay
            .ok_or_else(|| EngineError::invalid_config("backoff base delay is required"))?;
        let max_delay = self
            .max_delay
            .ok_or_else(|| EngineError::invalid_config("backoff max delay is required"))?;

        if max_delay < base_delay {
            return Err(EngineError::invalid_config(format!(
                "backoff max delay must be >= base delay: base={base_delay:?}, max={max_delay:?}"
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(EngineError::invalid_config(format!(
                "backoff jitter factor must be within 0.0..=1.0: {}",
                self.jitter_factor
            )));
        }

        Ok(ExponentialBackoff {
            base_delay,
            max_delay,
            jitter_factor: self.jitter_factor,
        })
    }
}

/// 固定时长退避，忽略重试次数
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for ConstantBackoff {
    fn next_interval(&self, _attempts: u32) -> Duration {
        self.delay
    }
}
