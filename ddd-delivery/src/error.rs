//! 投递核心统一错误定义
//!
//! 聚焦配置校验、参数校验、存储访问、租约与追赶流程等最小必要集合，
//! 便于存储实现层统一转换为 `DeliveryError`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DeliveryError {
    // --- 配置/参数 ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("no handler registered for target type: {type_url}")]
    UnknownTarget { type_url: String },

    // --- 存储 ---
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("transient storage error: {reason}")]
    TransientStorage { reason: String },
    #[error("storage corrupted: {reason}")]
    Corrupted { reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 追赶 ---
    #[error("catch-up already started: projection={projection_type}, id={id}")]
    CatchUpAlreadyStarted { projection_type: String, id: String },
    #[error("catch-up not found: {id}")]
    CatchUpNotFound { id: String },
}

impl DeliveryError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientStorage {
            reason: reason.into(),
        }
    }

    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }

    /// 可由工作循环退避重试的错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }
}

/// 统一 Result 类型别名
pub type DeliveryResult<T> = Result<T, DeliveryError>;

// ---- Cross-crate conversions for infrastructure convenience ----
// 持久化实现可直接使用 `?` 将 sqlx 错误转换为 DeliveryError

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DeliveryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DeliveryError::TransientStorage {
                    reason: err.to_string(),
                }
            }
            other => DeliveryError::Storage {
                reason: other.to_string(),
            },
        }
    }
}

impl From<uuid::Error> for DeliveryError {
    fn from(err: uuid::Error) -> Self {
        DeliveryError::InvalidArgument {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_storage_errors_are_retryable() {
        assert!(DeliveryError::transient("timeout").is_transient());
        assert!(!DeliveryError::storage("disk full").is_transient());
        assert!(!DeliveryError::corrupted("foreign shard").is_transient());
    }

    #[test]
    fn uuid_parse_errors_become_invalid_arguments() {
        let err: DeliveryError = uuid::Uuid::parse_str("not-a-uuid").unwrap_err().into();
        match err {
            DeliveryError::InvalidArgument { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
