#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! A key/value broker abstraction, and the distributed lock and map primitives built over it.
//!
//! Namespacing follows the source system's own conventions: lock keys are prefixed
//! `one_instance_lock `, and queue-tracking keys `celery_utils_tasks_queue`, so that a shared
//! Redis instance can be inspected with tooling built for that system.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("broker backend error: {0}")]
  Backend(String),
  #[error("key not found: {0}")]
  NotFound(String),
  #[error("malformed value stored under {key}: {source}")]
  Malformed {
    key: String,
    #[source]
    source: serde_json::Error,
  },
}

/// The storage operations a broker backend must provide. Values are opaque byte strings; typed
/// access is layered on top by [`DistributedMap`].
#[async_trait]
pub trait Broker: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error>;
  /// Sets `key` to `value` only if absent, atomically. Returns `true` if the set happened.
  async fn set_if_absent(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<bool, Error>;
  async fn delete(&self, key: &str) -> Result<bool, Error>;
  /// Deletes `key` only if its current value equals `expected`, atomically. Used by lock
  /// release to avoid a holder deleting a lock some other owner has since acquired.
  async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, Error>;
}

/// A `redis`-backed broker, matching the `celery_utils_tasks_queue<hash>` /
/// `one_instance_lock <hash>` namespace conventions of the source task-queue system.
pub struct RedisBroker {
  manager: redis::aio::ConnectionManager,
}

impl RedisBroker {
  pub async fn connect(url: &str) -> Result<RedisBroker, Error> {
    let client = redis::Client::open(url).map_err(|e| Error::Backend(e.to_string()))?;
    let manager = client
      .get_connection_manager()
      .await
      .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(RedisBroker { manager })
  }
}

#[async_trait]
impl Broker for RedisBroker {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
    let mut conn = self.manager.clone();
    redis::cmd("GET")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(|e| Error::Backend(e.to_string()))
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
    let mut conn = self.manager.clone();
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
      cmd.arg("PX").arg(ttl.as_millis() as u64);
    }
    cmd
      .query_async::<()>(&mut conn)
      .await
      .map_err(|e| Error::Backend(e.to_string()))
  }

  async fn set_if_absent(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<bool, Error> {
    let mut conn = self.manager.clone();
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("NX");
    if let Some(ttl) = ttl {
      cmd.arg("PX").arg(ttl.as_millis() as u64);
    }
    let reply: Option<String> = cmd
      .query_async(&mut conn)
      .await
      .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(reply.is_some())
  }

  async fn delete(&self, key: &str) -> Result<bool, Error> {
    let mut conn = self.manager.clone();
    let removed: i64 = redis::cmd("DEL")
      .arg(key)
      .query_async(&mut conn)
      .await
      .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(removed > 0)
  }

  async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, Error> {
    // Lua script for atomic compare-and-delete: Redis has no native CAD command.
    const SCRIPT: &str = r"
      if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
      else
        return 0
      end
    ";
    let mut conn = self.manager.clone();
    let removed: i64 = redis::Script::new(SCRIPT)
      .key(key)
      .arg(expected)
      .invoke_async(&mut conn)
      .await
      .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(removed > 0)
  }
}

struct Entry {
  value: Vec<u8>,
  expires_at: Option<tokio::time::Instant>,
}

/// A sharded, `parking_lot`-guarded in-memory broker with a background reaper, used in tests
/// and as a single-process fallback when no Redis instance is configured.
pub struct InMemoryBroker {
  shards: Vec<Mutex<HashMap<String, Entry>>>,
}

const SHARD_COUNT: usize = 16;

impl InMemoryBroker {
  pub fn new() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker {
      shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
    });
    let reaper_target = Arc::downgrade(&broker);
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        match reaper_target.upgrade() {
          Some(broker) => broker.reap_expired(),
          None => break,
        }
      }
    });
    broker
  }

  fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key.as_bytes());
    &self.shards[(hasher.finish() as usize) % self.shards.len()]
  }

  fn reap_expired(&self) {
    let now = tokio::time::Instant::now();
    for shard in &self.shards {
      shard.lock().retain(|_, entry| match entry.expires_at {
        Some(expires_at) => expires_at > now,
        None => true,
      });
    }
  }
}

#[async_trait]
impl Broker for InMemoryBroker {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
    let shard = self.shard(key).lock();
    Ok(shard.get(key).filter(|e| !is_expired(e)).map(|e| e.value.clone()))
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
    let mut shard = self.shard(key).lock();
    shard.insert(
      key.to_string(),
      Entry {
        value,
        expires_at: ttl.map(|d| tokio::time::Instant::now() + d),
      },
    );
    Ok(())
  }

  async fn set_if_absent(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<bool, Error> {
    let mut shard = self.shard(key).lock();
    if shard.get(key).map(|e| !is_expired(e)).unwrap_or(false) {
      return Ok(false);
    }
    shard.insert(
      key.to_string(),
      Entry {
        value,
        expires_at: ttl.map(|d| tokio::time::Instant::now() + d),
      },
    );
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<bool, Error> {
    Ok(self.shard(key).lock().remove(key).is_some())
  }

  async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, Error> {
    let mut shard = self.shard(key).lock();
    let matches = shard
      .get(key)
      .map(|e| !is_expired(e) && e.value == expected)
      .unwrap_or(false);
    if matches {
      shard.remove(key);
    }
    Ok(matches)
  }
}

fn is_expired(entry: &Entry) -> bool {
  entry
    .expires_at
    .map(|at| at <= tokio::time::Instant::now())
    .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
  #[error("lock is held by another owner")]
  Locked,
  #[error(transparent)]
  Broker(#[from] Error),
}

/// A held lock's release token. Dropping this without calling [`DistributedLock::release`]
/// leaks the lock until its TTL expires; callers that need release-on-every-exit-path should use
/// [`DistributedLock::with_lock`] instead.
#[derive(Clone)]
pub struct LockToken {
  key: String,
  token: String,
}

/// A TTL-bound mutual-exclusion lock over a [`Broker`]. The TTL bounds the worst case a crashed
/// holder can wedge the key; release uses compare-and-delete against the holder's own token so a
/// holder can never delete a lock acquired by someone else after its own expired.
pub struct DistributedLock<B: Broker> {
  broker: Arc<B>,
}

fn lock_key(name: &str) -> String {
  format!("one_instance_lock {name}")
}

impl<B: Broker> DistributedLock<B> {
  pub fn new(broker: Arc<B>) -> DistributedLock<B> {
    DistributedLock { broker }
  }

  /// Attempts to acquire `name` without blocking. Fails with [`LockError::Locked`] if held.
  pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken, LockError> {
    let token = uuid::Uuid::new_v4().to_string();
    let key = lock_key(name);
    let acquired = self
      .broker
      .set_if_absent(&key, token.clone().into_bytes(), Some(ttl))
      .await?;
    if acquired {
      Ok(LockToken { key, token })
    } else {
      Err(LockError::Locked)
    }
  }

  pub async fn release(&self, token: &LockToken) -> Result<(), Error> {
    self
      .broker
      .compare_and_delete(&token.key, token.token.as_bytes())
      .await?;
    Ok(())
  }

  /// Runs `body` while holding `name`, releasing it afterward on every exit path (success,
  /// error, or panic unwind).
  pub async fn with_lock<T, F, Fut>(&self, name: &str, ttl: Duration, body: F) -> Result<T, LockError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let token = self.acquire(name, ttl).await?;
    let result = body().await;
    if let Err(e) = self.release(&token).await {
      log::warn!("failed to release lock {name:?}: {e}");
    }
    Ok(result)
  }
}

/// A keyed store over a [`Broker`], where keys are arbitrary structured values reduced to a flat
/// string via the system's fingerprint function, and values are JSON-serializable data.
pub struct DistributedMap<B: Broker> {
  broker: Arc<B>,
  default_ttl: Option<Duration>,
}

fn map_key(key: &fingerprint::Key) -> String {
  format!("celery_utils_tasks_queue{}", key.to_hex())
}

impl<B: Broker> DistributedMap<B> {
  pub fn new(broker: Arc<B>, default_ttl: Option<Duration>) -> DistributedMap<B> {
    DistributedMap { broker, default_ttl }
  }

  pub async fn contains(&self, key: &fingerprint::Key) -> Result<bool, Error> {
    Ok(self.broker.get(&map_key(key)).await?.is_some())
  }

  pub async fn get<T: DeserializeOwned>(&self, key: &fingerprint::Key) -> Result<T, Error> {
    let bytes = self
      .broker
      .get(&map_key(key))
      .await?
      .ok_or_else(|| Error::NotFound(key.to_hex()))?;
    serde_json::from_slice(&bytes).map_err(|source| Error::Malformed {
      key: key.to_hex(),
      source,
    })
  }

  pub async fn set<T: Serialize>(&self, key: &fingerprint::Key, value: &T) -> Result<(), Error> {
    let bytes = serde_json::to_vec(value).map_err(|source| Error::Malformed {
      key: key.to_hex(),
      source,
    })?;
    self.broker.set(&map_key(key), bytes, self.default_ttl).await
  }

  pub async fn delete(&self, key: &fingerprint::Key) -> Result<bool, Error> {
    self.broker.delete(&map_key(key)).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use fingerprint::{Value, KEY_SIZE};

  fn test_key() -> fingerprint::Key {
    fingerprint::key("test.fn", &[Value::Int(1)], &[], &Default::default())
  }

  #[tokio::test]
  async fn in_memory_broker_set_get_round_trips() {
    let broker = InMemoryBroker::new();
    broker.set("k", b"v".to_vec(), None).await.unwrap();
    assert_eq!(broker.get("k").await.unwrap(), Some(b"v".to_vec()));
  }

  #[tokio::test]
  async fn set_if_absent_refuses_when_already_present() {
    let broker = InMemoryBroker::new();
    assert!(broker.set_if_absent("k", b"a".to_vec(), None).await.unwrap());
    assert!(!broker.set_if_absent("k", b"b".to_vec(), None).await.unwrap());
    assert_eq!(broker.get("k").await.unwrap(), Some(b"a".to_vec()));
  }

  #[tokio::test]
  async fn ttl_expiry_is_observed() {
    let broker = InMemoryBroker::new();
    broker
      .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(broker.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn compare_and_delete_only_matches_expected_value() {
    let broker = InMemoryBroker::new();
    broker.set("k", b"owner-a".to_vec(), None).await.unwrap();
    assert!(!broker.compare_and_delete("k", b"owner-b").await.unwrap());
    assert!(broker.compare_and_delete("k", b"owner-a").await.unwrap());
    assert_eq!(broker.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn lock_acquire_fails_when_already_held() {
    let broker = InMemoryBroker::new();
    let lock = DistributedLock::new(broker);
    let token = lock.acquire("region", Duration::from_secs(30)).await.unwrap();
    assert!(matches!(
      lock.acquire("region", Duration::from_secs(30)).await,
      Err(LockError::Locked)
    ));
    lock.release(&token).await.unwrap();
    assert!(lock.acquire("region", Duration::from_secs(30)).await.is_ok());
  }

  #[tokio::test]
  async fn with_lock_releases_after_body_runs() {
    let broker = InMemoryBroker::new();
    let lock = DistributedLock::new(broker);
    lock
      .with_lock("region", Duration::from_secs(30), || async { 7 })
      .await
      .unwrap();
    assert!(lock.acquire("region", Duration::from_secs(30)).await.is_ok());
  }

  #[tokio::test]
  async fn distributed_map_round_trips_typed_values() {
    let broker = InMemoryBroker::new();
    let map = DistributedMap::new(broker, None);
    let key = test_key();
    assert!(!map.contains(&key).await.unwrap());
    map.set(&key, &vec![1, 2, 3]).await.unwrap();
    assert!(map.contains(&key).await.unwrap());
    let value: Vec<i32> = map.get(&key).await.unwrap();
    assert_eq!(value, vec![1, 2, 3]);
    assert!(map.delete(&key).await.unwrap());
    assert!(!map.contains(&key).await.unwrap());
  }

  #[test]
  fn key_size_constant_is_stable() {
    assert_eq!(KEY_SIZE, 16);
  }
}
