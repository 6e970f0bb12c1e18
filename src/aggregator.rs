// ===============================
// src/aggregator.rs (PositionAggregator)
// ===============================
//
// Listener: trade-record write notifications -> dirty set (no work yet).
// Reconciler: every `interval`, swap the dirty set out and recompute each
// pair from a full scan of its records, overwriting the position.
//
// Recompute-from-scratch makes duplicated, reordered or lost notifications
// harmless; the startup sweep repairs anything missed while down.
//
use std::sync::{Arc, Mutex};

use ahash::AHashSet as HashSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::domain::{PairKey, TradeKey, TradeRecord, POSITIONS_HASH, TRADE_KEY_PATTERN};
use crate::metrics::{DIRTY_SET_SIZE, POSITIONS_MARKED_DIRTY, POSITIONS_REAGGREGATED};
use crate::shard::LetterRange;
use crate::store::{KeyOp, SharedStore, StoreError, Subscription};

#[derive(Debug, Clone)]
pub struct AggregatorCfg {
    pub interval: Duration,
    /// Mark every owned pair dirty before the first cycle.
    pub startup_sweep: bool,
}

impl Default for AggregatorCfg {
    fn default() -> Self {
        Self { interval: Duration::from_millis(1000), startup_sweep: true }
    }
}

#[derive(Clone)]
pub struct PositionAggregator {
    store: SharedStore,
    range: LetterRange,
    cfg: AggregatorCfg,
    dirty: Arc<Mutex<HashSet<PairKey>>>,
}

impl PositionAggregator {
    pub fn new(store: SharedStore, range: LetterRange, cfg: AggregatorCfg) -> Self {
        Self { store, range, cfg, dirty: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub fn range(&self) -> LetterRange {
        self.range
    }

    pub fn owns(&self, pair: &PairKey) -> bool {
        self.range.owns_account(&pair.account)
    }

    /// Adds `pair` to the dirty set. False if it was already pending.
    pub fn mark_dirty(&self, pair: PairKey) -> bool {
        match self.dirty.lock() {
            Ok(mut d) => d.insert(pair),
            Err(p) => p.into_inner().insert(pair),
        }
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().map(|d| d.len()).unwrap_or_default()
    }

    fn take_dirty(&self) -> HashSet<PairKey> {
        match self.dirty.lock() {
            Ok(mut d) => std::mem::take(&mut *d),
            Err(p) => std::mem::take(&mut *p.into_inner()),
        }
    }

    /// Handles one notification; only record writes in the owned range count.
    pub fn on_event(&self, key: &str, op: KeyOp) -> bool {
        if op != KeyOp::HSet {
            return false;
        }
        let Ok(tk) = key.parse::<TradeKey>() else {
            return false;
        };
        if !self.owns(&tk.pair) {
            return false;
        }
        POSITIONS_MARKED_DIRTY.inc();
        self.mark_dirty(tk.pair);
        true
    }

    /// Marks every pair with at least one record in the owned range dirty.
    pub async fn mark_all_dirty(&self) -> Result<usize, StoreError> {
        let keys = self.store.scan(TRADE_KEY_PATTERN).await?;
        let mut pairs: HashSet<PairKey> = HashSet::new();
        for k in keys {
            if let Ok(tk) = k.parse::<TradeKey>() {
                if self.owns(&tk.pair) {
                    pairs.insert(tk.pair);
                }
            }
        }
        let n = pairs.len();
        for p in pairs {
            self.mark_dirty(p);
        }
        Ok(n)
    }

    /// Recomputes one position as the signed sum of all of its records and
    /// overwrites the stored value. `None` when the sum does not fit an `i64`;
    /// the stored position is then left as it was.
    pub async fn reaggregate(&self, pair: &PairKey) -> Result<Option<i64>, StoreError> {
        let keys = self.store.scan(&pair.records_pattern()).await?;
        let mut net = 0i64;
        for k in keys {
            let Ok(tk) = k.parse::<TradeKey>() else { continue };
            if &tk.pair != pair {
                continue;
            }
            let fields = match self.store.hgetall(&k).await {
                Ok(f) if f.is_empty() => continue,
                Ok(f) => f,
                Err(e) if !e.is_transient() => {
                    debug!(key = %k, error = %e, "skipping unreadable record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rec = match TradeRecord::from_fields(tk, &fields) {
                Ok(rec) => rec,
                Err(e) => {
                    debug!(key = %k, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            match net.checked_add(rec.signed_quantity()) {
                Some(n) => net = n,
                None => {
                    warn!(pair = %pair, key = %k, "position overflows i64, left unchanged");
                    return Ok(None);
                }
            }
        }
        self.store
            .hset(POSITIONS_HASH, &pair.position_field(), &net.to_string())
            .await?;
        POSITIONS_REAGGREGATED.inc();
        Ok(Some(net))
    }

    /// Drains the dirty set once. On a store error the unfinished pairs go back
    /// into the set for the next cycle.
    pub async fn reconcile_once(&self) -> Result<usize, StoreError> {
        let pending: Vec<PairKey> = self.take_dirty().into_iter().collect();
        DIRTY_SET_SIZE
            .with_label_values(&[&self.range.to_string()])
            .set(pending.len() as i64);
        for (i, pair) in pending.iter().enumerate() {
            if let Err(e) = self.reaggregate(pair).await {
                for p in &pending[i..] {
                    self.mark_dirty(p.clone());
                }
                return Err(e);
            }
        }
        if !pending.is_empty() {
            debug!(range = %self.range, pairs = pending.len(), "positions reconciled");
        }
        Ok(pending.len())
    }

    async fn listen(self, mut sub: Subscription) {
        while let Some(ev) = sub.next().await {
            self.on_event(&ev.key, ev.op);
        }
        warn!(range = %self.range, "notification stream closed, listener stopped");
    }

    pub async fn run(self) {
        info!(range = %self.range, interval_ms = self.cfg.interval.as_millis() as u64, "position aggregator started");
        // subscribe before the sweep so nothing written in between is missed
        let sub = self.store.subscribe(TRADE_KEY_PATTERN);
        let listener = tokio::spawn(self.clone().listen(sub));

        let mut backoff = Backoff::default();
        if self.cfg.startup_sweep {
            loop {
                match self.mark_all_dirty().await {
                    Ok(n) => {
                        info!(range = %self.range, pairs = n, "startup sweep queued");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "startup sweep failed");
                        backoff.wait("aggregator").await;
                    }
                }
            }
            backoff.reset();
        }

        let mut tick = interval(self.cfg.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if listener.is_finished() {
                warn!(range = %self.range, "aggregator listener gone, stopping");
                return;
            }
            match self.reconcile_once().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, range = %self.range, "reconcile cycle failed");
                    backoff.wait("aggregator").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TradeSubmission, DATE_FMT};
    use crate::memstore::MemoryStore;
    use crate::store::Store;
    use chrono::NaiveDate;

    async fn book(store: &MemoryStore, raw: &str, id: &str) -> String {
        let sub: TradeSubmission = raw.parse().unwrap();
        let date = NaiveDate::parse_from_str("2024-01-02", DATE_FMT).unwrap();
        let time = crate::domain::parse_time("10:00:00").unwrap();
        let rec = TradeRecord::from_submission(&sub, date, time, id.into());
        let key = rec.key.to_string();
        store.hset_many(&key, &rec.to_fields()).await.unwrap();
        key
    }

    fn agg(store: Arc<MemoryStore>, range: &str) -> PositionAggregator {
        PositionAggregator::new(store, range.parse().unwrap(), AggregatorCfg::default())
    }

    #[tokio::test]
    async fn reaggregate_sums_signed_quantities() {
        let mem = Arc::new(MemoryStore::new());
        book(&mem, "alice,AAPL:150:buy:100:trade", "1").await;
        book(&mem, "alice,AAPL:160:buy:50:trade", "2").await;
        book(&mem, "alice,AAPL:170:sell:120:trade", "3").await;
        book(&mem, "alice,AAPLX:1:buy:7:trade", "4").await;
        // half-written record is ignored
        mem.hset("alice,AAPL:2024-01-02:5", "ticker", "AAPL").await.unwrap();

        let a = agg(mem.clone(), "a-z");
        assert_eq!(a.reaggregate(&PairKey::new("alice", "AAPL")).await.unwrap(), Some(30));
        assert_eq!(mem.hget(POSITIONS_HASH, "alice:AAPL").await.unwrap().as_deref(), Some("30"));
    }

    #[tokio::test]
    async fn oversized_or_foreign_values_do_not_break_the_sum() {
        let mem = Arc::new(MemoryStore::new());
        book(&mem, "bob,MSFT:1:buy:5:trade", "1").await;
        // written around the booker, which refuses these quantities
        for (id, qty) in [("max", "9223372036854775807"), ("one", "1")] {
            let fields: Vec<(String, String)> = [
                ("trade_time", "10:00:00"),
                ("ticker", "MSFT"),
                ("price", "1"),
                ("type", "buy"),
                ("quantity", qty),
                ("action_type", "trade"),
            ]
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
            mem.hset_many(&format!("bob,MSFT:2024-01-02:{id}"), &fields).await.unwrap();
        }
        mem.set("bob,MSFT:2024-01-02:str", "not a hash").await.unwrap();

        let a = agg(mem.clone(), "a-z");
        // the i64::MAX record is rejected by the field codec, the other two count
        assert_eq!(a.reaggregate(&PairKey::new("bob", "MSFT")).await.unwrap(), Some(6));
        a.mark_dirty(PairKey::new("bob", "MSFT"));
        a.mark_dirty(PairKey::new("carl", "MSFT"));
        assert_eq!(a.reconcile_once().await.unwrap(), 2);
        assert_eq!(mem.hget(POSITIONS_HASH, "bob:MSFT").await.unwrap().as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn events_outside_range_or_not_records_are_ignored() {
        let mem = Arc::new(MemoryStore::new());
        let a = agg(mem, "a-m");
        assert!(a.on_event("alice,AAPL:2024-01-02:x", KeyOp::HSet));
        assert!(!a.on_event("nancy,AAPL:2024-01-02:x", KeyOp::HSet));
        assert!(!a.on_event("alice,AAPL:2024-01-02:x", KeyOp::Del));
        assert!(!a.on_event("positions", KeyOp::HSet));
        assert!(a.on_event("alice,AAPL:2024-01-02:y", KeyOp::HSet));
        assert_eq!(a.dirty_len(), 1);
    }

    #[tokio::test]
    async fn startup_sweep_marks_owned_pairs() {
        let mem = Arc::new(MemoryStore::new());
        book(&mem, "alice,AAPL:1:buy:1:trade", "1").await;
        book(&mem, "alice,MSFT:1:buy:1:trade", "2").await;
        book(&mem, "zoe,AAPL:1:buy:1:trade", "3").await;
        let a = agg(mem.clone(), "a-m");
        assert_eq!(a.mark_all_dirty().await.unwrap(), 2);
        assert_eq!(a.reconcile_once().await.unwrap(), 2);
        assert_eq!(a.dirty_len(), 0);
        assert_eq!(mem.hget(POSITIONS_HASH, "zoe:AAPL").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_cycle_keeps_pairs_dirty() {
        let mem = Arc::new(MemoryStore::new());
        let a = agg(mem.clone(), "a-z");
        a.mark_dirty(PairKey::new("bob", "MSFT"));
        a.mark_dirty(PairKey::new("carl", "MSFT"));
        mem.set_available(false);
        assert!(a.reconcile_once().await.is_err());
        assert_eq!(a.dirty_len(), 2);
        mem.set_available(true);
        assert_eq!(a.reconcile_once().await.unwrap(), 2);
        assert_eq!(mem.hget(POSITIONS_HASH, "bob:MSFT").await.unwrap().as_deref(), Some("0"));
    }
}
