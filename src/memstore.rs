// ===============================
// src/memstore.rs (in-process shared store)
// ===============================
//
// Implements the whole Store surface in memory:
// - strings / hashes / lists / sets in one keyspace (a key has one kind)
// - append log with consumer groups, pending-entry list and auto-claim
// - write notifications over a broadcast channel
// - blocking pops parked on a Notify, never holding the lock across .await
//
// `set_available(false)` makes every call fail with Unavailable, which is how
// tests drive the retry/backoff paths. `fail_after(n)` lets n more calls
// through first, for failures partway through a multi-step operation.
//
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Notify};
use tokio::time::{timeout_at, Instant};

use crate::store::{glob_match, KeyEvent, KeyOp, Store, StoreError, StreamEntry, Subscription, Update, WriteOp};

const EVENT_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Hash,
    List,
    Set,
    Stream,
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Default)]
struct LogStream {
    next_id: u64,
    entries: BTreeMap<u64, HashMap<String, String>>,
    groups: AHashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Inner {
    strings: AHashMap<String, String>,
    hashes: AHashMap<String, HashMap<String, String>>,
    lists: AHashMap<String, VecDeque<String>>,
    sets: AHashMap<String, AHashSet<String>>,
    streams: AHashMap<String, LogStream>,
}

impl Inner {
    fn kind_of(&self, key: &str) -> Option<Kind> {
        if self.strings.contains_key(key) {
            Some(Kind::String)
        } else if self.hashes.contains_key(key) {
            Some(Kind::Hash)
        } else if self.lists.contains_key(key) {
            Some(Kind::List)
        } else if self.sets.contains_key(key) {
            Some(Kind::Set)
        } else if self.streams.contains_key(key) {
            Some(Kind::Stream)
        } else {
            None
        }
    }

    fn expect_kind(&self, key: &str, kind: Kind) -> Result<(), StoreError> {
        match self.kind_of(key) {
            Some(k) if k != kind => Err(StoreError::WrongType(key.to_string())),
            _ => Ok(()),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, StoreError> {
        self.expect_kind(key, Kind::Hash)?;
        Ok(self.hashes.entry(key.to_string()).or_default())
    }

    fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        self.expect_kind(key, Kind::String)?;
        let slot = self.strings.entry(key.to_string()).or_insert_with(|| "0".into());
        let n = slot
            .parse::<i64>()
            .map_err(|_| StoreError::Decode { key: key.to_string(), expected: "integer" })?
            + 1;
        *slot = n.to_string();
        Ok(n)
    }

    fn sadd(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.expect_kind(key, Kind::Set)?;
        Ok(self.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    fn stream_group(&mut self, stream: &str, group: &str) -> Result<(&mut LogStream, String), StoreError> {
        self.expect_kind(stream, Kind::Stream)?;
        let s = self.streams.get_mut(stream).ok_or_else(|| StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        if !s.groups.contains_key(group) {
            return Err(StoreError::NoGroup { stream: stream.to_string(), group: group.to_string() });
        }
        Ok((s, group.to_string()))
    }

    fn xack(&mut self, stream: &str, group: &str, id: u64) -> Result<bool, StoreError> {
        let (s, g) = self.stream_group(stream, group)?;
        Ok(s.groups.get_mut(&g).map(|g| g.pending.remove(&id).is_some()).unwrap_or(false))
    }

    fn pop_right(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let v = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
        }
        v
    }
}

/// In-process store shared by every component of one process.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KeyEvent>,
    list_pushed: Notify,
    stream_added: Notify,
    available: AtomicBool,
    // calls still allowed before the store goes away; negative means no limit
    calls_left: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            list_pushed: Notify::new(),
            stream_added: Notify::new(),
            available: AtomicBool::new(true),
            calls_left: AtomicI64::new(-1),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
        self.calls_left.store(-1, Ordering::SeqCst);
    }

    /// Serves `calls` more operations, then fails every call until
    /// `set_available(true)`.
    pub fn fail_after(&self, calls: u64) {
        self.calls_left.store(calls as i64, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let spent = self
            .calls_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1))
            .is_err_and(|n| n == 0);
        if spent || !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".into()))
    }

    fn notify(&self, key: &str, op: KeyOp) {
        // no subscribers is fine
        let _ = self.events.send(KeyEvent { key: key.to_string(), op });
    }

    fn try_pop_any(&self, keys: &[String]) -> Result<Option<(String, String)>, StoreError> {
        let popped = {
            let mut inner = self.lock()?;
            let mut found = None;
            for k in keys {
                inner.expect_kind(k, Kind::List)?;
                if let Some(v) = inner.pop_right(k) {
                    found = Some((k.clone(), v));
                    break;
                }
            }
            found
        };
        if let Some((k, _)) = &popped {
            self.notify(k, KeyOp::Pop);
        }
        Ok(popped)
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut inner = self.lock()?;
        let (s, g) = inner.stream_group(stream, group)?;
        let LogStream { entries, groups, .. } = s;
        let Some(grp) = groups.get_mut(&g) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut out = Vec::new();
        for (id, fields) in entries.range(grp.last_delivered + 1..).take(count) {
            out.push(StreamEntry { id: *id, fields: fields.clone() });
            grp.pending.insert(*id, Pending { consumer: consumer.to_string(), delivered_at: now, deliveries: 1 });
        }
        if let Some(last) = out.last() {
            grp.last_delivered = last.id;
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        inner.expect_kind(key, Kind::String)?;
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock()?;
            inner.expect_kind(key, Kind::String)?;
            inner.strings.insert(key.to_string(), value.to_string());
        }
        self.notify(key, KeyOp::Set);
        Ok(())
    }

    async fn update(&self, key: &str, f: Update<'_>) -> Result<Option<String>, StoreError> {
        let (after, wrote) = {
            let mut inner = self.lock()?;
            inner.expect_kind(key, Kind::String)?;
            let current = inner.strings.get(key).map(String::as_str);
            match f(current) {
                Some(next) => {
                    inner.strings.insert(key.to_string(), next.clone());
                    (Some(next), true)
                }
                None => (inner.strings.get(key).cloned(), false),
            }
        };
        if wrote {
            self.notify(key, KeyOp::Set);
        }
        Ok(after)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let n = self.lock()?.incr(key)?;
        self.notify(key, KeyOp::Incr);
        Ok(n)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut inner = self.lock()?;
            inner.strings.remove(key).is_some()
                | inner.hashes.remove(key).is_some()
                | inner.lists.remove(key).is_some()
                | inner.sets.remove(key).is_some()
                | inner.streams.remove(key).is_some()
        };
        if removed {
            self.notify(key, KeyOp::Del);
        }
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.hash_mut(key)?.insert(field.to_string(), value.to_string());
        self.notify(key, KeyOp::HSet);
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        {
            let mut inner = self.lock()?;
            let h = inner.hash_mut(key)?;
            for (f, v) in fields {
                h.insert(f.clone(), v.clone());
            }
        }
        self.notify(key, KeyOp::HSet);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        inner.expect_kind(key, Kind::Hash)?;
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.lock()?;
        inner.expect_kind(key, Kind::Hash)?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr_decimal(&self, key: &str, field: &str, delta: Decimal) -> Result<Decimal, StoreError> {
        let total = {
            let mut inner = self.lock()?;
            let h = inner.hash_mut(key)?;
            let current = match h.get(field) {
                Some(v) => Decimal::from_str(v)
                    .map_err(|_| StoreError::Decode { key: format!("{key}/{field}"), expected: "decimal" })?,
                None => Decimal::ZERO,
            };
            let total = current + delta;
            h.insert(field.to_string(), total.to_string());
            total
        };
        self.notify(key, KeyOp::HIncr);
        Ok(total)
    }

    async fn hupdate(&self, key: &str, field: &str, f: Update<'_>) -> Result<bool, StoreError> {
        let wrote = {
            let mut inner = self.lock()?;
            let h = inner.hash_mut(key)?;
            match f(h.get(field).map(String::as_str)) {
                Some(next) => {
                    h.insert(field.to_string(), next);
                    true
                }
                None => false,
            }
        };
        if wrote {
            self.notify(key, KeyOp::HSet);
        }
        Ok(wrote)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added = self.lock()?.sadd(key, member)?;
        self.notify(key, KeyOp::SAdd);
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        inner.expect_kind(key, Kind::Set)?;
        Ok(inner.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.lock()?;
            inner.expect_kind(key, Kind::List)?;
            let list = inner.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len()
        };
        self.notify(key, KeyOp::LPush);
        self.list_pushed.notify_waiters();
        Ok(len)
    }

    async fn brpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pushed = self.list_pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(hit) = self.try_pop_any(keys)? {
                return Ok(Some(hit));
            }
            if timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn rpop_many(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let out = {
            let mut inner = self.lock()?;
            inner.expect_kind(key, Kind::List)?;
            let mut out = Vec::new();
            while out.len() < count {
                match inner.pop_right(key) {
                    Some(v) => out.push(v),
                    None => break,
                }
            }
            out
        };
        if !out.is_empty() {
            self.notify(key, KeyOp::Pop);
        }
        Ok(out)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        inner.expect_kind(key, Kind::List)?;
        Ok(inner.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let keys = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.lists.keys())
            .chain(inner.sets.keys())
            .chain(inner.streams.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        Ok(keys)
    }

    fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription::new(self.events.subscribe(), pattern)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        inner.expect_kind(stream, Kind::Stream)?;
        let s = inner.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(false);
        }
        s.groups.insert(group.to_string(), Group::default());
        Ok(true)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<u64, StoreError> {
        let id = {
            let mut inner = self.lock()?;
            inner.expect_kind(stream, Kind::Stream)?;
            let s = inner.streams.entry(stream.to_string()).or_default();
            s.next_id += 1;
            let id = s.next_id;
            s.entries.insert(id, fields.iter().cloned().collect());
            id
        };
        self.notify(stream, KeyOp::XAdd);
        self.stream_added.notify_waiters();
        Ok(id)
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            let added = self.stream_added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            let batch = self.deliver_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if timeout_at(deadline, added).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut inner = self.lock()?;
        let (s, g) = inner.stream_group(stream, group)?;
        let LogStream { entries, groups, .. } = s;
        let Some(grp) = groups.get_mut(&g) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut out = Vec::new();
        let mut gone = Vec::new();
        for (id, p) in grp.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(p.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.deliveries += 1;
                    out.push(StreamEntry { id: *id, fields: fields.clone() });
                }
                None => gone.push(*id),
            }
        }
        for id in gone {
            grp.pending.remove(&id);
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, id: u64) -> Result<bool, StoreError> {
        self.lock()?.xack(stream, group, id)
    }

    async fn xpending(&self, stream: &str, group: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let (s, g) = inner.stream_group(stream, group)?;
        Ok(s.groups.get(&g).map(|g| g.pending.len()).unwrap_or(0))
    }

    async fn pipeline(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut touched: Vec<(String, KeyOp)> = Vec::with_capacity(ops.len());
        {
            let mut inner = self.lock()?;
            for op in ops {
                match op {
                    WriteOp::HSet { key, fields } => {
                        let h = inner.hash_mut(&key)?;
                        h.extend(fields);
                        touched.push((key, KeyOp::HSet));
                    }
                    WriteOp::SAdd { key, member } => {
                        inner.sadd(&key, &member)?;
                        touched.push((key, KeyOp::SAdd));
                    }
                    WriteOp::Incr { key } => {
                        inner.incr(&key)?;
                        touched.push((key, KeyOp::Incr));
                    }
                    WriteOp::XAck { stream, group, id } => {
                        inner.xack(&stream, &group, id)?;
                    }
                }
            }
        }
        for (key, op) in touched {
            self.notify(&key, op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn fields(v: &str) -> Vec<(String, String)> {
        vec![("trade_string".to_string(), v.to_string())]
    }

    #[tokio::test]
    async fn consumer_group_delivers_each_entry_once() {
        let store = MemoryStore::new();
        assert!(store.xgroup_create("log", "g").await.unwrap());
        assert!(!store.xgroup_create("log", "g").await.unwrap());
        for i in 0..5 {
            store.xadd("log", &fields(&i.to_string())).await.unwrap();
        }
        let a = store.xreadgroup("log", "g", "c1", 3, Duration::ZERO).await.unwrap();
        let b = store.xreadgroup("log", "g", "c2", 10, Duration::ZERO).await.unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert_eq!(store.xpending("log", "g").await.unwrap(), 5);

        for e in a.iter().chain(b.iter()) {
            assert!(store.xack("log", "g", e.id).await.unwrap());
        }
        assert_eq!(store.xpending("log", "g").await.unwrap(), 0);
        assert!(store.xreadgroup("log", "g", "c1", 10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unacked_entries_are_reclaimed_after_idle() {
        let store = MemoryStore::new();
        store.xgroup_create("log", "g").await.unwrap();
        store.xadd("log", &fields("x")).await.unwrap();
        let first = store.xreadgroup("log", "g", "dead", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        let early = store.xautoclaim("log", "g", "alive", Duration::from_secs(60), 10).await.unwrap();
        assert!(early.is_empty());
        let claimed = store.xautoclaim("log", "g", "alive", Duration::ZERO, 10).await.unwrap();
        assert_eq!(claimed, first);
    }

    #[tokio::test]
    async fn xreadgroup_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        store.xgroup_create("log", "g").await.unwrap();
        let reader = {
            let s = store.clone();
            tokio::spawn(async move { s.xreadgroup("log", "g", "c", 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.xadd("log", &fields("late")).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn brpop_is_fifo_against_lpush_and_times_out() {
        let store = MemoryStore::new();
        for v in ["1", "2", "3"] {
            store.lpush("q:a", v).await.unwrap();
        }
        let keys = vec!["q:b".to_string(), "q:a".to_string()];
        let first = store.brpop(&keys, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, Some(("q:a".to_string(), "1".to_string())));
        assert_eq!(store.rpop_many("q:a", 10).await.unwrap(), vec!["2", "3"]);
        assert_eq!(store.brpop(&keys, Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn brpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let s = store.clone();
            tokio::spawn(async move { s.brpop(&["q".to_string()], Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.lpush("q", "k").await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some(("q".to_string(), "k".to_string())));
    }

    #[tokio::test]
    async fn hash_ops_and_notifications() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("*,*:*:*");
        store.hset("positions", "alice:AAPL", "1").await.unwrap();
        store
            .hset_many("alice,AAPL:2024-01-01:x", &fields("v"))
            .await
            .unwrap();
        let ev = sub.next().await.unwrap();
        assert_eq!(ev, KeyEvent { key: "alice,AAPL:2024-01-01:x".into(), op: KeyOp::HSet });

        assert_eq!(store.hincr_decimal("r", "a/X", dec!(1.25)).await.unwrap(), dec!(1.25));
        assert_eq!(store.hincr_decimal("r", "a/X", dec!(-0.25)).await.unwrap(), dec!(1.00));

        let wrote = store.hupdate("u", "f", &|old| if old.is_none() { Some("1".into()) } else { None }).await.unwrap();
        assert!(wrote);
        let wrote = store.hupdate("u", "f", &|old| if old.is_none() { Some("2".into()) } else { None }).await.unwrap();
        assert!(!wrote);
        assert_eq!(store.hget("u", "f").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn wrong_type_and_unavailable() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(matches!(store.hget("k", "f").await, Err(StoreError::WrongType(_))));
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.fail_after(2);
        assert!(store.get("k").await.is_ok());
        assert!(store.set("k", "w").await.is_ok());
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn pipeline_applies_all_writes() {
        let store = MemoryStore::new();
        store.xgroup_create("log", "g").await.unwrap();
        store.xadd("log", &fields("s")).await.unwrap();
        let e = store.xreadgroup("log", "g", "c", 1, Duration::ZERO).await.unwrap();
        store
            .pipeline(vec![
                WriteOp::HSet { key: "h".into(), fields: fields("a") },
                WriteOp::SAdd { key: "accounts".into(), member: "alice".into() },
                WriteOp::Incr { key: "n".into() },
                WriteOp::XAck { stream: "log".into(), group: "g".into(), id: e[0].id },
            ])
            .await
            .unwrap();
        assert_eq!(store.hget("h", "trade_string").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.smembers("accounts").await.unwrap(), vec!["alice"]);
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.xpending("log", "g").await.unwrap(), 0);
    }
}
