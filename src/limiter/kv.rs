//! Coordination store client.
//!
//! The ephemeral store is a Redis-compatible key-value service reached
//! over its REST endpoint (single POST with a command array). Only the
//! handful of commands the governor needs are exposed, behind a trait so
//! tests can run against the in-memory implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PipelineError;

/// Commands the rate-limit governor needs from the coordination store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic increment; creates the key at `by` when absent.
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, PipelineError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError>;

    /// Remaining TTL in seconds; -1 when the key has no expiry, -2 when
    /// the key does not exist (Redis semantics).
    async fn ttl(&self, key: &str) -> Result<i64, PipelineError>;

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, PipelineError>;

    /// Set-if-absent with TTL. True when this caller created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64)
        -> Result<bool, PipelineError>;

    /// Atomically delete the key only if its value equals `value`.
    /// True when a key was deleted.
    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool, PipelineError>;
}

const DELETE_IF_EQUALS_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// REST client for an Upstash-style Redis endpoint.
pub struct RestKv {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestKv {
    pub fn new(base_url: String, token: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| PipelineError::RateLimiter(format!("client build: {err}")))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Execute one command array and return the `result` field.
    async fn command(&self, cmd: &[serde_json::Value]) -> Result<serde_json::Value, PipelineError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await
            .map_err(|err| PipelineError::RateLimiter(format!("request: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::RateLimiter(format!(
                "store returned {status}: {body}"
            )));
        }

        let mut payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| PipelineError::RateLimiter(format!("response parse: {err}")))?;
        Ok(payload
            .get_mut("result")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl KvStore for RestKv {
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, PipelineError> {
        let result = self.command(&[json!("INCRBY"), json!(key), json!(by)]).await?;
        result
            .as_i64()
            .ok_or_else(|| PipelineError::RateLimiter(format!("INCRBY returned {result}")))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let result = self.command(&[json!("GET"), json!(key)]).await?;
        Ok(match result {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    async fn ttl(&self, key: &str) -> Result<i64, PipelineError> {
        let result = self.command(&[json!("TTL"), json!(key)]).await?;
        result
            .as_i64()
            .ok_or_else(|| PipelineError::RateLimiter(format!("TTL returned {result}")))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, PipelineError> {
        let result = self
            .command(&[json!("EXPIRE"), json!(key), json!(seconds)])
            .await?;
        Ok(result.as_i64() == Some(1))
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, PipelineError> {
        let result = self
            .command(&[
                json!("SET"),
                json!(key),
                json!(value),
                json!("NX"),
                json!("EX"),
                json!(ttl_seconds),
            ])
            .await?;
        // SET ... NX returns OK when the key was created, null otherwise.
        Ok(result.as_str() == Some("OK"))
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool, PipelineError> {
        let result = self
            .command(&[
                json!("EVAL"),
                json!(DELETE_IF_EQUALS_SCRIPT),
                json!("1"),
                json!(key),
                json!(value),
            ])
            .await?;
        Ok(result.as_i64() == Some(1))
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory coordination store with TTL semantics, for tests and local
/// dry runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, MemoryEntry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, PipelineError> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| PipelineError::RateLimiter(format!("non-integer value at {key}")))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + by;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn ttl(&self, key: &str) -> Result<i64, PipelineError> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_none() {
            return Ok(-2);
        }
        Ok(match entries.get(key).and_then(|e| e.expires_at) {
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
            None => -1,
        })
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        debug!(key, ttl_seconds, "memory kv set");
        Ok(true)
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock();
        match Self::live_value(&mut entries, key) {
            Some(current) if current == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A store whose every operation fails; used to test fail-closed paths.
#[cfg(test)]
pub struct UnreachableKv;

#[cfg(test)]
#[async_trait]
impl KvStore for UnreachableKv {
    async fn incr_by(&self, _key: &str, _by: i64) -> Result<i64, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
    async fn get(&self, _key: &str) -> Result<Option<String>, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
    async fn ttl(&self, _key: &str) -> Result<i64, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
    async fn expire(&self, _key: &str, _seconds: u64) -> Result<bool, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
    async fn set_nx_ex(
        &self,
        _key: &str,
        _value: &str,
        _ttl: u64,
    ) -> Result<bool, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
    async fn del_if_equals(&self, _key: &str, _value: &str) -> Result<bool, PipelineError> {
        Err(PipelineError::RateLimiter("store unreachable".to_string()))
    }
}
