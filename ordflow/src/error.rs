//! 引擎统一错误定义
//!
//! 聚焦配置校验、契约违规、broker 交互与处理器失败等最小必要集合，
//! 便于在各实现层统一转换为 `EngineError`。
//!
use thiserror::Error;

/// 统一错误类型（引擎最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    // --- 配置（构造期 fail-fast，运行期不应出现） ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    // --- 调用方契约违规 ---
    #[error("contract violation: {reason}")]
    Contract { reason: String },

    // --- broker 交互 ---
    #[error("broker error: {reason}")]
    Broker { reason: String },

    // --- 处理器 ---
    #[error("batch handler error: handler={handler}, reason={reason}")]
    Handler { handler: String, reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn contract(reason: impl Into<String>) -> Self {
        Self::Contract {
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EngineResult<T> = Result<T, EngineError>;
