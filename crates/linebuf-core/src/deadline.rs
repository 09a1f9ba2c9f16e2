//! Deadlines around remote calls
//!
//! Every call to the remote store is bounded. An expired deadline drops the
//! pending future and yields `RowError::Timeout`, so callers never wait on a
//! request the user already considers failed.

use std::future::Future;
use std::time::Duration;

use linebuf_api::RowError;

use crate::traits::Result;

pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> std::result::Result<T, RowError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RowError::ServerRejection {
            message: e.to_string(),
        }),
        Err(_) => Err(RowError::Timeout),
    }
}
