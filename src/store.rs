/// Bounded store calls
///
/// Every call into the user store or the refresh ledger goes through
/// `bounded`. A call that outlives its budget surfaces as an internal
/// failure and never as an allow decision.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, DatabaseError};

pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Store call timed out"
            );
            Err(AppError::Database(DatabaseError::Timeout))
        }
    }
}
