// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Get,
    Put,
    Delete,
    List,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<std::time::Instant>,
}

impl Entry {
    fn expired(&self, now: std::time::Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

// Error returned by the next `remaining` operations of type `op` on keys
// starting with `key_prefix`.
struct Fault {
    op: StoreOperation,
    key_prefix: Option<String>,
    remaining: usize,
    error: StoreError,
}

#[derive(Default)]
struct MemoryStoreInner {
    entries: std::collections::BTreeMap<String, Entry>,
    faults: Vec<Fault>,
}

impl MemoryStoreInner {
    fn take_fault(&mut self, op: StoreOperation, key: &str) -> Option<StoreError> {
        let pos = self.faults.iter().position(|fault| {
            fault.op == op && fault.remaining > 0 && fault.key_prefix.as_ref().map_or(true, |prefix| key.starts_with(prefix.as_str()))
        })?;
        let fault = &mut self.faults[pos];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(pos);
        }
        Some(error)
    }
}

/// An artifact store that keeps everything in memory.
///
/// Keys are kept ordered, so that listing behaves like a prefix scan over an
/// object store. Expired entries are invisible to reads and scans and they
/// are dropped lazily.
///
/// Failures can be injected to exercise the retry and teardown logic.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations of type `op` fail with `error`,
    /// optionally only for keys (or list prefixes) starting with `key_prefix`.
    pub async fn inject_fault(&self, op: StoreOperation, key_prefix: Option<&str>, count: usize, error: StoreError) {
        self.inner.lock().await.faults.push(Fault {
            op,
            key_prefix: key_prefix.map(|x| x.to_string()),
            remaining: count,
            error,
        });
    }

    /// All the live keys, in order.
    pub async fn keys(&self) -> Vec<String> {
        let now = std::time::Instant::now();
        let inner = self.inner.lock().await;
        inner.entries.iter().filter(|(_, entry)| !entry.expired(now)).map(|(key, _)| key.clone()).collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        let now = std::time::Instant::now();
        let inner = self.inner.lock().await;
        inner.entries.get(key).is_some_and(|entry| !entry.expired(now))
    }
}

#[async_trait::async_trait]
impl super::ArtifactStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = std::time::Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.take_fault(StoreOperation::Get, key) {
            return Err(err);
        }
        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, opts: super::PutOptions) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.take_fault(StoreOperation::Put, key) {
            return Err(err);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: opts.ttl.map(|ttl| std::time::Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.take_fault(StoreOperation::Delete, key) {
            return Err(err);
        }
        inner.entries.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str, opts: super::ListOptions) -> Result<super::ListPage, StoreError> {
        let now = std::time::Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.take_fault(StoreOperation::List, prefix) {
            return Err(err);
        }
        let max_keys = opts.max_keys.unwrap_or(super::DEFAULT_MAX_KEYS);
        let lower = match opts.continuation_token.or(opts.start_after) {
            Some(start) if start.as_str() >= prefix => std::ops::Bound::Excluded(start),
            _ => std::ops::Bound::Included(prefix.to_string()),
        };

        let mut page = super::ListPage::default();
        for (key, entry) in inner.entries.range::<String, _>((lower, std::ops::Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if entry.expired(now) {
                continue;
            }
            if page.items.len() == max_keys {
                page.truncated = true;
                break;
            }
            page.items.push(key.clone());
        }
        if page.truncated {
            page.continuation_token = page.items.last().cloned();
        }
        Ok(page)
    }
}
