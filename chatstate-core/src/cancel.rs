use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::StoreError;

/// Runs `operation` unless `token` fires first.
///
/// A cancelled operation is dropped at its current await point. Backends keep
/// each write a single atomic request, so dropping never leaves a partial put.
pub async fn cancellable<T, F>(token: &CancellationToken, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StoreError::Cancelled),
        result = operation => result,
    }
}

pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
