// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::StoreError;

/// An artifact store that uses a Redis in-memory database.
///
/// The following keys are written:
/// - {namespace}obj:KEY, the value of the artifact KEY, with an expiration
///   time if a TTL was requested
/// - {namespace}index, a sorted set with all the artifact keys, all with the
///   same score so that prefix scans can be served with ZRANGEBYLEX
///
/// Entries of the index whose value has expired are removed when found
/// during a scan.
pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
    namespace: String,
}

// Index entries fetched per round-trip during scans.
const SCAN_BATCH: usize = 256;

impl RedisStore {
    pub async fn new(redis_url: &str, namespace: &str) -> anyhow::Result<Self> {
        log::info!("creating Redis artifact store at URL {} namespace '{}'", redis_url, namespace);
        let connection = redis::Client::open(redis_url)?.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            namespace: namespace.to_string(),
        })
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}obj:{}", self.namespace, key)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.namespace)
    }

    // Fetch up to `count` index entries strictly after `start` (or from
    // `prefix` included) and within the prefix.
    async fn scan_index(&self, prefix: &str, start: Option<&str>, count: usize) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();
        let mut min = Vec::new();
        match start {
            Some(start) if start >= prefix => {
                min.push(b'(');
                min.extend_from_slice(start.as_bytes());
            }
            _ => {
                min.push(b'[');
                min.extend_from_slice(prefix.as_bytes());
            }
        }
        let max = if prefix.is_empty() {
            b"+".to_vec()
        } else {
            let mut max = vec![b'['];
            max.extend_from_slice(prefix.as_bytes());
            max.push(0xff);
            max
        };
        let keys: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(self.index_key())
            .arg(min.as_slice())
            .arg(max.as_slice())
            .arg("LIMIT")
            .arg(0)
            .arg(count)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(keys)
    }

    // Remove from the index the given keys whose value does not exist.
    // Existence is checked again within the script, which runs atomically,
    // so that a key written after the scan keeps its index entry.
    async fn prune(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut connection = self.connection.clone();
        let script = redis::Script::new(PRUNE_SCRIPT);
        let mut invocation = script.key(self.index_key());
        for key in keys {
            invocation.key(self.object_key(key)).arg(key);
        }
        invocation.invoke_async(&mut connection).await.map_err(store_error)
    }
}

// KEYS[1] is the index, KEYS[i + 1] the object of the index member ARGV[i].
const PRUNE_SCRIPT: &str = r"
local removed = 0
for i, member in ipairs(ARGV) do
    if redis.call('EXISTS', KEYS[i + 1]) == 0 then
        removed = removed + redis.call('ZREM', KEYS[1], member)
    end
end
return removed
";

fn store_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Permanent(err.to_string())
    }
}

#[async_trait::async_trait]
impl super::ArtifactStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.object_key(key))
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Vec<u8>, opts: super::PutOptions) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        match opts.ttl {
            Some(ttl) => {
                pipe.cmd("SET")
                    .arg(self.object_key(key))
                    .arg(value)
                    .arg("PX")
                    .arg(std::cmp::max(1, ttl.as_millis() as u64))
                    .ignore();
            }
            None => {
                pipe.cmd("SET").arg(self.object_key(key)).arg(value).ignore();
            }
        }
        pipe.cmd("ZADD").arg(self.index_key()).arg(0).arg(key).ignore();
        let _: () = pipe.query_async(&mut connection).await.map_err(store_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.object_key(key))
            .ignore()
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(key)
            .ignore()
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str, opts: super::ListOptions) -> Result<super::ListPage, StoreError> {
        let max_keys = opts.max_keys.unwrap_or(super::DEFAULT_MAX_KEYS);
        let mut cursor = opts.continuation_token.or(opts.start_after);
        let mut live = vec![];

        // Collect one more live key than requested to tell whether the
        // listing is truncated.
        loop {
            let batch = self.scan_index(prefix, cursor.as_deref(), SCAN_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let mut connection = self.connection.clone();
            let mut pipe = redis::pipe();
            for key in &batch {
                pipe.cmd("EXISTS").arg(self.object_key(key));
            }
            let exists: Vec<bool> = pipe.query_async(&mut connection).await.map_err(store_error)?;

            let mut expired = vec![];
            for (key, exists) in batch.iter().zip(exists) {
                if exists {
                    live.push(key.clone());
                } else {
                    expired.push(key.clone());
                }
            }
            if !expired.is_empty() {
                let pruned = self.prune(&expired).await?;
                log::debug!("pruned {} of {} expired keys from the index", pruned, expired.len());
            }

            if live.len() > max_keys || batch.len() < SCAN_BATCH {
                break;
            }
            cursor = batch.last().cloned();
        }

        let truncated = live.len() > max_keys;
        live.truncate(max_keys);
        Ok(super::ListPage {
            continuation_token: match truncated {
                true => live.last().cloned(),
                false => None,
            },
            items: live,
            truncated,
        })
    }
}
