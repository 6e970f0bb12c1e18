// ===============================
// src/store.rs (shared store interface)
// ===============================
//
// The narrow surface every component talks to. Only single-key atomic
// operations are offered (increment, decimal increment, read-modify-write);
// there are no multi-key transactions. A pipeline batches independent writes
// so they travel together, nothing more.
//
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
    #[error("no consumer group {group:?} on stream {stream:?}")]
    NoGroup { stream: String, group: String },
    #[error("value at {key} is not a valid {expected}")]
    Decode { key: String, expected: &'static str },
}

impl StoreError {
    /// Worth retrying: the store may answer next time. Anything else is about
    /// the data under one key and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Kind of write that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    Set,
    HSet,
    HIncr,
    LPush,
    Pop,
    SAdd,
    Incr,
    XAdd,
    Del,
}

/// Keyspace-style change notification: which key, which write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub op: KeyOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: u64,
    pub fields: HashMap<String, String>,
}

/// Writes that may be batched into one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    HSet { key: String, fields: Vec<(String, String)> },
    SAdd { key: String, member: String },
    Incr { key: String },
    XAck { stream: String, group: String, id: u64 },
}

/// Read-modify-write callback: receives the current value, returns the value
/// to store or `None` to leave it untouched.
pub type Update<'a> = &'a (dyn Fn(Option<&str>) -> Option<String> + Send + Sync);

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), StoreError>;

    // ---- strings ----
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Atomic read-modify-write of one string key. Returns the stored value afterwards.
    async fn update(&self, key: &str, f: Update<'_>) -> Result<Option<String>, StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    // ---- hashes ----
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    /// Atomic decimal increment of one hash field. Returns the new value.
    async fn hincr_decimal(&self, key: &str, field: &str, delta: Decimal) -> Result<Decimal, StoreError>;
    /// Atomic read-modify-write of one hash field. Returns true when a value was written.
    async fn hupdate(&self, key: &str, field: &str, f: Update<'_>) -> Result<bool, StoreError>;

    // ---- sets ----
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // ---- lists ----
    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;
    /// Blocks until one of `keys` has an element or `timeout` elapses; pops from the right.
    async fn brpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>, StoreError>;
    /// Non-blocking pop of up to `count` elements from the right (oldest first).
    async fn rpop_many(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    // ---- keyspace ----
    /// All keys matching a glob (`*`, `?`), in no particular order.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
    /// Write notifications for keys matching `pattern`.
    fn subscribe(&self, pattern: &str) -> Subscription;

    // ---- append log with consumer groups ----
    /// Creates the group (and the stream if missing). `Ok(false)` if it already existed.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<bool, StoreError>;
    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<u64, StoreError>;
    /// Delivers up to `count` never-delivered entries to `consumer`, waiting up to `block`.
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;
    /// Transfers entries pending longer than `min_idle` to `consumer` and redelivers them.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;
    async fn xack(&self, stream: &str, group: &str, id: u64) -> Result<bool, StoreError>;
    async fn xpending(&self, stream: &str, group: &str) -> Result<usize, StoreError>;

    /// Applies a batch of writes in order; notifications follow the whole batch.
    async fn pipeline(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Live feed of write notifications filtered by a glob.
pub struct Subscription {
    rx: broadcast::Receiver<KeyEvent>,
    pattern: String,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<KeyEvent>, pattern: &str) -> Self {
        Self { rx, pattern: pattern.to_string() }
    }

    /// Next matching event. Notifications dropped because this subscriber fell
    /// behind are lost, as with any fire-and-forget pub/sub. `None` once the
    /// store is gone.
    pub async fn next(&mut self) -> Option<KeyEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if glob_match(&self.pattern, &ev.key) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, pattern = %self.pattern, "subscriber lagged, notifications lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<KeyEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if glob_match(&self.pattern, &ev.key) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(missed = n, pattern = %self.pattern, "subscriber lagged, notifications lost");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Waits for the store to answer a ping, polling once a second.
pub async fn wait_ready(store: &dyn Store, timeout: Duration) -> Result<(), StoreError> {
    info!("waiting for store to be ready...");
    let deadline = Instant::now() + timeout;
    loop {
        match store.ping().await {
            Ok(()) => {
                info!("store is ready");
                return Ok(());
            }
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => sleep(Duration::from_secs(1)).await,
        }
    }
}
