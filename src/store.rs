//! Coordination store shared by every component.
//!
//! All locks, dedupe markers, caches, reopen windows and the event queue
//! live here. [`RedisStore`] is the production backend; [`MemoryStore`]
//! keeps the same semantics inside one process for local runs and tests.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write. `None` keeps the key until it is deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Writes only when the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes `key` only while it still holds `expected`. Returns whether
    /// the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Remaining lifetime. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Every key matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn push(&self, list: &str, value: &str) -> Result<()>;

    /// Pops the head of `list`, waiting up to `timeout` for an element.
    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>>;

    async fn list_len(&self, list: &str) -> Result<usize>;

    async fn ping(&self) -> Result<()>;
}

pub type SharedStore = Arc<dyn CoordinationStore>;

const SCAN_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn_manager: ConnectionManager,
    // BLPOP parks its connection; it must not share the multiplexed one.
    blocking: Arc<tokio::sync::Mutex<Option<MultiplexedConnection>>>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("create redis client")?;
        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .context("create redis connection manager")?;

        Ok(Self {
            client,
            conn_manager,
            blocking: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get(key)
            .await
            .with_context(|| format!("redis GET {key}"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl_seconds(ttl))
                .await
                .with_context(|| format!("redis SETEX {key}"))?,
            None => conn
                .set(key, value)
                .await
                .with_context(|| format!("redis SET {key}"))?,
        };
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis SET NX {key}"))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .with_context(|| format!("redis DEL {key}"))?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        let removed: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("redis compare-and-delete {key}"))?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn_manager.clone();
        let seconds: i64 = conn
            .ttl(key)
            .await
            .with_context(|| format!("redis TTL {key}"))?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(seconds).ok().map(Duration::from_secs))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        conn.incr(key, by)
            .await
            .with_context(|| format!("redis INCRBY {key}"))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("redis SCAN {pattern}"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn push(&self, list: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = conn
            .rpush(list, value)
            .await
            .with_context(|| format!("redis RPUSH {list}"))?;
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .context("open blocking redis connection")?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(anyhow!("blocking redis connection unavailable"));
        };

        let reply: redis::RedisResult<Option<(String, String)>> = redis::cmd("BLPOP")
            .arg(list)
            .arg(ttl_seconds(timeout))
            .query_async(conn)
            .await;
        match reply {
            Ok(popped) => Ok(popped.map(|(_list, value)| value)),
            Err(error) => {
                // reconnect on the next call
                *guard = None;
                Err(error).with_context(|| format!("redis BLPOP {list}"))
            }
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn_manager.clone();
        conn.llen(list)
            .await
            .with_context(|| format!("redis LLEN {list}"))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING")?;
        Ok(())
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Single-process store with Redis semantics: expiry, NX writes, counters,
/// glob scans and blocking list pops.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, apply: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let now = Instant::now();
        guard.retain(|_, entry| entry.is_live(now));
        Ok(apply(&mut guard))
    }

    fn try_pop(&self, list: &str) -> Result<Option<String>> {
        self.with_entries(|entries| {
            let popped = match entries.get_mut(list) {
                Some(Entry {
                    slot: Slot::List(items),
                    ..
                }) => items.pop_front(),
                _ => None,
            };
            if matches!(entries.get(list), Some(Entry { slot: Slot::List(items), .. }) if items.is_empty())
            {
                entries.remove(list);
            }
            popped
        })
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(anyhow!("WRONGTYPE {key} holds a list")),
            None => Ok(None),
        })?
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Text(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        })
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Text(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| entries.remove(key).is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_entries(|entries| {
            let holds_expected = matches!(
                entries.get(key),
                Some(Entry { slot: Slot::Text(value), .. }) if value == expected
            );
            if holds_expected {
                entries.remove(key);
            }
            holds_expected
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.with_entries(|entries| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
        })
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                slot: Slot::Text("0".to_string()),
                expires_at: None,
            });
            let Slot::Text(raw) = &mut entry.slot else {
                return Err(anyhow!("WRONGTYPE {key} holds a list"));
            };
            let current = raw
                .parse::<i64>()
                .with_context(|| format!("{key} is not an integer"))?;
            let next = current.saturating_add(by);
            *raw = next.to_string();
            Ok(next)
        })?
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| {
            let mut keys = entries
                .keys()
                .filter(|key| glob_matches(pattern, key))
                .cloned()
                .collect::<Vec<_>>();
            keys.sort();
            keys
        })
    }

    async fn push(&self, list: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(list.to_string()).or_insert(Entry {
                slot: Slot::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.slot {
                Slot::List(items) => {
                    items.push_back(value.to_string());
                    Ok(())
                }
                Slot::Text(_) => Err(anyhow!("WRONGTYPE {list} holds a string")),
            }
        })??;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        self.with_entries(|entries| match entries.get(list) {
            Some(Entry {
                slot: Slot::List(items),
                ..
            }) => items.len(),
            _ => 0,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-style glob supporting `*` and `?`.
fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let candidate = candidate.chars().collect::<Vec<_>>();
    let (mut p, mut c) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some('?') => {
                p += 1;
                c += 1;
            }
            Some(expected) if *expected == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|character| *character == '*')
}
