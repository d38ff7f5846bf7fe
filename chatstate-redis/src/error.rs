use fred::error::{RedisError, RedisErrorKind};
use thiserror::Error;

use chatstate_core::StoreError;

/// Failures while setting up a [`crate::RedisDatabase`].
#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("invalid redis url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to redis: {0}")]
    Connect(String),
    #[error("failed to load lua scripts: {0}")]
    ScriptLoad(String),
}

impl From<RedisStoreError> for StoreError {
    fn from(value: RedisStoreError) -> Self {
        match value {
            RedisStoreError::InvalidUrl(_) => StoreError::InvalidConfig(value.to_string()),
            other => StoreError::Transient(other.to_string()),
        }
    }
}

pub(crate) fn map_redis_error(error: RedisError) -> StoreError {
    match error.kind() {
        RedisErrorKind::Canceled => StoreError::Cancelled,
        RedisErrorKind::Parse => StoreError::serialization("redis reply", error.details()),
        RedisErrorKind::Config | RedisErrorKind::Url | RedisErrorKind::Auth => {
            StoreError::InvalidConfig(error.to_string())
        }
        RedisErrorKind::InvalidArgument | RedisErrorKind::InvalidCommand => {
            StoreError::validation(error.to_string())
        }
        _ => StoreError::transient(error.to_string()),
    }
}
