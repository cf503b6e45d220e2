// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

pub mod memory;
pub mod redis_store;

use crate::error::{PipelineError, PipelineResult, StoreError};

/// Page size used when the caller does not specify one.
pub const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// The artifact is removed automatically after this interval.
    pub ttl: Option<std::time::Duration>,
}

impl PutOptions {
    pub fn with_ttl(ttl: std::time::Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub max_keys: Option<usize>,
    /// Only keys strictly greater than this one are returned.
    pub start_after: Option<String>,
    /// Token returned by a previous truncated page, it takes precedence over
    /// `start_after`.
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    /// Keys in ascending byte order.
    pub items: Vec<String>,
    pub truncated: bool,
    pub continuation_token: Option<String>,
}

/// Narrow contract over the object store and key-value registry where the
/// pipeline keeps its artifacts.
///
/// Implementations do not retry: transient failures are reported as
/// [`StoreError::Transient`] and retried by [`StoreHandle`].
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<(), StoreError>;

    /// Remove the given key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list_by_prefix(&self, prefix: &str, opts: ListOptions) -> Result<ListPage, StoreError>;
}

/// Shared access to an artifact store with capped exponential backoff on
/// transient failures.
#[derive(Clone)]
pub struct StoreHandle {
    store: std::sync::Arc<dyn ArtifactStore>,
    retry: crate::RetrySettings,
}

impl StoreHandle {
    pub fn new(store: std::sync::Arc<dyn ArtifactStore>, retry: crate::RetrySettings) -> Self {
        Self { store, retry }
    }

    pub async fn get(&self, key: &str) -> PipelineResult<Option<Vec<u8>>> {
        let store = self.store.as_ref();
        self.with_backoff("get", key, move || store.get(key)).await
    }

    pub async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> PipelineResult<()> {
        let store = self.store.as_ref();
        self.with_backoff("put", key, move || store.put(key, value.clone(), opts.clone())).await
    }

    pub async fn delete(&self, key: &str) -> PipelineResult<()> {
        let store = self.store.as_ref();
        self.with_backoff("delete", key, move || store.delete(key)).await
    }

    pub async fn list_by_prefix(&self, prefix: &str, opts: ListOptions) -> PipelineResult<ListPage> {
        let store = self.store.as_ref();
        self.with_backoff("list", prefix, move || store.list_by_prefix(prefix, opts.clone())).await
    }

    /// Collect all the keys with the given prefix, following the
    /// continuation tokens until the scan is exhausted.
    pub async fn list_all(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let mut keys = vec![];
        let mut continuation_token = None;
        loop {
            let page = self
                .list_by_prefix(
                    prefix,
                    ListOptions {
                        max_keys: Some(DEFAULT_MAX_KEYS),
                        start_after: None,
                        continuation_token: continuation_token.take(),
                    },
                )
                .await?;
            keys.extend(page.items);
            match (page.truncated, page.continuation_token) {
                (true, Some(token)) => continuation_token = Some(token),
                (true, None) => {
                    return Err(PipelineError::Internal(format!(
                        "truncated listing of {} without continuation token",
                        prefix
                    )))
                }
                (false, _) => break,
            }
        }
        Ok(keys)
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> PipelineResult<Option<T>> {
        match self.get(key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T, opts: PutOptions) -> PipelineResult<()> {
        self.put(key, serde_json::to_vec(value)?, opts).await
    }

    async fn with_backoff<T, F, Fut>(&self, op: &str, key: &str, f: F) -> PipelineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = std::cmp::max(1, self.retry.max_attempts);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(val) => return Ok(val),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "store {} {} failed (attempt {}/{}), retrying in {} ms: {}",
                        op,
                        key,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    log::error!("store {} {} failed after {} attempts: {}", op, key, attempt, err);
                    return Err(PipelineError::StoreUnavailable(format!("{} {}: {}", op, key, err)));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
