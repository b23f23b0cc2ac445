//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run a blocking git/filesystem call off the async worker threads.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Turn an arbitrary id into something safe for branch and directory names.
pub fn sanitize_ref_component(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.chars().take(48).collect()
    }
}
