// ===============================
// src/router.rs (NotificationRouter)
// ===============================
//
// Trade-record write notifications -> per-shard work queues.
//
// - key must be "{account},{ticker}:{YYYY-MM-DD}:{id}", anything else is ignored
// - shard = lowercase first letter of the account, LPUSH onto pnl_queue:{letter}
// - watermark = max routed trade timestamp, persisted, never moves backward
//
// Startup: replay every record newer than the watermark in ascending timestamp
// order (scan order is arbitrary, FIFO ledgers need chronology), then go live.
//
use ahash::AHashSet as HashSet;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::domain::{
    parse_time, shard_queue_key, trade_timestamp, TradeKey, F_SEQ, F_TIME, TRADE_KEY_PATTERN, WATERMARK_KEY,
};
use crate::metrics::{KEYS_IGNORED, KEYS_REPLAYED, KEYS_ROUTED, WATERMARK};
use crate::shard::shard_of;
use crate::store::{KeyOp, SharedStore, StoreError, Subscription};

#[derive(Debug, Clone)]
pub struct RouterCfg {
    /// Catch up on records booked while the router was down.
    pub replay_on_start: bool,
}

impl Default for RouterCfg {
    fn default() -> Self {
        Self { replay_on_start: true }
    }
}

/// A trade key that passed validation, with its target shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routable {
    pub raw: String,
    pub key: TradeKey,
    pub shard: char,
}

/// Validates a notification key. `None` for anything that is not a trade record.
pub fn classify(raw: &str) -> Option<Routable> {
    let key = raw.parse::<TradeKey>().ok()?;
    let shard = shard_of(key.account())?;
    Some(Routable { raw: raw.to_string(), key, shard })
}

fn parse_ts(v: &str) -> Option<i64> {
    let v = v.trim();
    v.parse::<i64>()
        .ok()
        .or_else(|| v.parse::<f64>().ok().map(|f| f as i64))
}

pub struct NotificationRouter {
    store: SharedStore,
    cfg: RouterCfg,
    // keys routed by replay whose live notification may still be buffered
    replayed: HashSet<String>,
    // newest timestamp queued by replay, not yet folded into the watermark
    replay_high: Option<i64>,
}

impl NotificationRouter {
    pub fn new(store: SharedStore, cfg: RouterCfg) -> Self {
        Self { store, cfg, replayed: HashSet::new(), replay_high: None }
    }

    pub async fn watermark(&self) -> Result<Option<i64>, StoreError> {
        match self.store.get(WATERMARK_KEY).await? {
            None => Ok(None),
            Some(v) => parse_ts(&v)
                .map(Some)
                .ok_or(StoreError::Decode { key: WATERMARK_KEY.into(), expected: "timestamp" }),
        }
    }

    /// Raises the persisted watermark to `ts` if that is higher. Returns the
    /// watermark after the update.
    pub async fn advance_watermark(&self, ts: i64) -> Result<i64, StoreError> {
        let bump = move |cur: Option<&str>| match cur.and_then(parse_ts) {
            Some(c) if c >= ts => None,
            _ => Some(ts.to_string()),
        };
        let after = self
            .store
            .update(WATERMARK_KEY, &bump)
            .await?
            .and_then(|v| parse_ts(&v))
            .unwrap_or(ts);
        WATERMARK.set(after);
        Ok(after)
    }

    /// Replay sort key of a booked record: trade timestamp, then log sequence.
    /// A record with no readable time sorts at midnight of its key's date.
    /// `None` when the key holds something other than a record hash.
    pub async fn record_order(&self, key: &TradeKey) -> Result<Option<(i64, u64)>, StoreError> {
        let fields = match self.store.hgetall(&key.to_string()).await {
            Ok(f) => f,
            Err(e) if !e.is_transient() => {
                warn!(key = %key, error = %e, "trade key holds no record, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let time = fields
            .get(F_TIME)
            .and_then(|t| parse_time(t).ok())
            .unwrap_or_default();
        let seq = fields.get(F_SEQ).and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(Some((trade_timestamp(key.date, time), seq)))
    }

    async fn push(&self, r: &Routable) -> Result<(), StoreError> {
        self.store.lpush(&shard_queue_key(r.shard), &r.raw).await?;
        KEYS_ROUTED.with_label_values(&[&r.shard.to_string()]).inc();
        Ok(())
    }

    /// Pushes one validated key onto its shard queue and advances the watermark.
    pub async fn route(&self, r: &Routable, ts: i64) -> Result<(), StoreError> {
        self.push(r).await?;
        self.advance_watermark(ts).await?;
        debug!(key = %r.raw, shard = %r.shard, ts, "trade key routed");
        Ok(())
    }

    /// Live path for one notification. Returns true when the key was routed.
    pub async fn on_notification(&mut self, raw: &str) -> Result<bool, StoreError> {
        let Some(r) = classify(raw) else {
            KEYS_IGNORED.inc();
            return Ok(false);
        };
        if self.replayed.remove(raw) {
            debug!(key = %raw, "already routed by replay");
            return Ok(false);
        }
        let Some((ts, _)) = self.record_order(&r.key).await? else {
            KEYS_IGNORED.inc();
            return Ok(false);
        };
        self.route(&r, ts).await?;
        Ok(true)
    }

    /// Routes every record newer than the persisted watermark, oldest first.
    ///
    /// The watermark moves only after every missed record is queued, so an
    /// interrupted replay can be run again without losing records that share
    /// a second with one already queued. Keys queued by an interrupted run are
    /// not queued twice.
    pub async fn replay_missed(&mut self) -> Result<usize, StoreError> {
        let wm = self.watermark().await?;
        let mut pending: Vec<((i64, u64), Routable)> = Vec::new();
        for raw in self.store.scan(TRADE_KEY_PATTERN).await? {
            let Some(r) = classify(&raw) else { continue };
            if self.replayed.contains(&r.raw) {
                continue;
            }
            let Some(order) = self.record_order(&r.key).await? else { continue };
            if wm.map_or(true, |w| order.0 > w) {
                pending.push((order, r));
            }
        }
        pending.sort_by_key(|(order, _)| *order);

        for ((ts, _), r) in &pending {
            self.push(r).await?;
            KEYS_REPLAYED.inc();
            self.replayed.insert(r.raw.clone());
            self.replay_high = Some(self.replay_high.map_or(*ts, |h| h.max(*ts)));
        }
        if let Some(high) = self.replay_high {
            self.advance_watermark(high).await?;
            self.replay_high = None;
        }
        info!(watermark = ?wm, replayed = pending.len(), "startup replay complete");
        Ok(pending.len())
    }

    /// Keys replayed but still waiting for their live notification to be seen.
    pub fn replayed_pending(&self) -> usize {
        self.replayed.len()
    }

    /// Routes notifications buffered while replay ran, then forgets the
    /// replayed keys. Every replayed key was written before the replay scan,
    /// so its notification, if any, is already in the buffer.
    pub async fn drain_backlog(&mut self, sub: &mut Subscription, backoff: &mut Backoff) -> usize {
        let mut routed = 0;
        while let Some(ev) = sub.try_next() {
            if ev.op == KeyOp::HSet && self.deliver(&ev.key, backoff).await {
                routed += 1;
            }
        }
        self.replayed.clear();
        routed
    }

    // retry this key until the store takes it, a lost key is a lost trade
    async fn deliver(&mut self, raw: &str, backoff: &mut Backoff) -> bool {
        loop {
            match self.on_notification(raw).await {
                Ok(routed) => {
                    backoff.reset();
                    return routed;
                }
                Err(e) => {
                    warn!(key = %raw, error = %e, "routing failed");
                    backoff.wait("router").await;
                }
            }
        }
    }

    pub async fn run(mut self) {
        info!(replay = self.cfg.replay_on_start, "notification router started");
        // subscribe first: records booked during replay are not lost
        let mut sub = self.store.subscribe(TRADE_KEY_PATTERN);
        let mut backoff = Backoff::default();

        if self.cfg.replay_on_start {
            while let Err(e) = self.replay_missed().await {
                warn!(error = %e, "startup replay failed");
                backoff.wait("router").await;
            }
            backoff.reset();
            let routed = self.drain_backlog(&mut sub, &mut backoff).await;
            debug!(routed, "backlog after replay routed");
        }

        while let Some(ev) = sub.next().await {
            if ev.op != KeyOp::HSet {
                continue;
            }
            self.deliver(&ev.key, &mut backoff).await;
        }
        warn!("notification stream closed, router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{parse_date, TradeRecord, TradeSubmission};
    use crate::memstore::MemoryStore;
    use crate::store::Store;
    use proptest::prelude::*;
    use std::sync::Arc;

    async fn book(store: &MemoryStore, raw: &str, date: &str, time: &str, id: &str) -> String {
        let sub: TradeSubmission = raw.parse().unwrap();
        let rec = TradeRecord::from_submission(&sub, parse_date(date).unwrap(), parse_time(time).unwrap(), id.into());
        let key = rec.key.to_string();
        store.hset_many(&key, &rec.to_fields()).await.unwrap();
        key
    }

    #[test]
    fn classification() {
        let r = classify("Bob,MSFT:2024-03-01:x").unwrap();
        assert_eq!(r.shard, 'b');
        assert!(classify("bob,MSFT:2024-02-30:x").is_none());
        assert!(classify("bob,MSFT:2024-03-01").is_none());
        assert!(classify("bobMSFT:2024-03-01:x").is_none());
        assert!(classify("pnl_queue:b").is_none());
    }

    #[tokio::test]
    async fn live_notification_routes_and_advances() {
        let mem = Arc::new(MemoryStore::new());
        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        let key = book(&mem, "bob,MSFT:300:buy:5:trade", "2024-03-01", "10:00:00", "k1").await;

        assert!(router.on_notification(&key).await.unwrap());
        assert!(!router.on_notification("positions").await.unwrap());
        assert_eq!(mem.rpop_many("pnl_queue:b", 10).await.unwrap(), vec![key]);
        assert_eq!(router.watermark().await.unwrap(), Some(1_709_287_200));
    }

    #[tokio::test]
    async fn replay_is_sorted_and_bounded_by_watermark() {
        let mem = Arc::new(MemoryStore::new());
        let late = book(&mem, "alice,AAPL:3:sell:1:trade", "2024-01-02", "12:00:00", "c").await;
        let early = book(&mem, "alice,AAPL:1:buy:1:trade", "2024-01-02", "10:00:00", "a").await;
        let mid = book(&mem, "alice,AAPL:2:buy:1:trade", "2024-01-02", "11:00:00", "b").await;
        let _old = book(&mem, "alice,AAPL:9:buy:1:trade", "2024-01-02", "09:00:00", "z").await;

        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        let nine = trade_timestamp(parse_date("2024-01-02").unwrap(), parse_time("09:00:00").unwrap());
        router.advance_watermark(nine).await.unwrap();

        assert_eq!(router.replay_missed().await.unwrap(), 3);
        assert_eq!(mem.rpop_many("pnl_queue:a", 10).await.unwrap(), vec![early, mid, late.clone()]);

        // the buffered live notification for a replayed key is not routed twice
        assert!(!router.on_notification(&late).await.unwrap());
        assert_eq!(mem.llen("pnl_queue:a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn same_second_trades_replay_in_log_order() {
        let mem = Arc::new(MemoryStore::new());
        let mut keys = Vec::new();
        for (seq, raw) in [(3u64, "ann,MSFT:1:sell:1:trade"), (1, "ann,MSFT:1:buy:2:trade"), (2, "ann,MSFT:1:buy:1:trade")] {
            let sub: TradeSubmission = raw.parse().unwrap();
            let rec = TradeRecord::from_submission(
                &sub,
                parse_date("2024-01-02").unwrap(),
                parse_time("10:00:00").unwrap(),
                format!("id{seq}"),
            )
            .with_seq(seq);
            mem.hset_many(&rec.key.to_string(), &rec.to_fields()).await.unwrap();
            keys.push((seq, rec.key.to_string()));
        }
        keys.sort();
        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        router.replay_missed().await.unwrap();
        let routed = mem.rpop_many("pnl_queue:a", 10).await.unwrap();
        assert_eq!(routed, keys.into_iter().map(|(_, k)| k).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn interrupted_replay_keeps_same_second_records() {
        let mem = Arc::new(MemoryStore::new());
        let mut keys = Vec::new();
        for (seq, raw) in [(1u64, "amy,AAPL:10:buy:5:trade"), (2, "amy,AAPL:11:sell:2:trade")] {
            let sub: TradeSubmission = raw.parse().unwrap();
            let rec = TradeRecord::from_submission(
                &sub,
                parse_date("2024-01-02").unwrap(),
                parse_time("10:00:00").unwrap(),
                format!("id{seq}"),
            )
            .with_seq(seq);
            mem.hset_many(&rec.key.to_string(), &rec.to_fields()).await.unwrap();
            keys.push(rec.key.to_string());
        }

        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        // watermark read, scan, two record reads, first push; the second push fails
        mem.fail_after(5);
        assert!(router.replay_missed().await.is_err());
        mem.set_available(true);
        assert_eq!(router.watermark().await.unwrap(), None);

        assert_eq!(router.replay_missed().await.unwrap(), 1);
        assert_eq!(mem.rpop_many("pnl_queue:a", 10).await.unwrap(), keys);
        let ten = trade_timestamp(parse_date("2024-01-02").unwrap(), parse_time("10:00:00").unwrap());
        assert_eq!(router.watermark().await.unwrap(), Some(ten));
    }

    #[tokio::test]
    async fn backlog_drain_forgets_replayed_keys() {
        let mem = Arc::new(MemoryStore::new());
        let down = book(&mem, "ann,MSFT:1:buy:1:trade", "2024-01-02", "10:00:00", "a").await;
        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        let mut sub = mem.subscribe(TRADE_KEY_PATTERN);
        let during = book(&mem, "ann,MSFT:1:buy:2:trade", "2024-01-02", "10:00:01", "b").await;

        assert_eq!(router.replay_missed().await.unwrap(), 2);
        assert_eq!(router.replayed_pending(), 2);
        let mut backoff = Backoff::default();
        assert_eq!(router.drain_backlog(&mut sub, &mut backoff).await, 0);
        assert_eq!(router.replayed_pending(), 0);

        let after = book(&mem, "ann,MSFT:1:sell:3:trade", "2024-01-02", "10:00:02", "c").await;
        let ev = sub.next().await.unwrap();
        assert!(router.on_notification(&ev.key).await.unwrap());
        assert_eq!(mem.rpop_many("pnl_queue:a", 10).await.unwrap(), vec![down, during, after]);
    }

    #[tokio::test]
    async fn non_record_value_under_a_trade_key_is_skipped() {
        let mem = Arc::new(MemoryStore::new());
        mem.set("ann,MSFT:2024-01-02:str", "not a hash").await.unwrap();
        let good = book(&mem, "ann,MSFT:1:buy:1:trade", "2024-01-02", "10:00:00", "a").await;
        let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
        assert_eq!(router.replay_missed().await.unwrap(), 1);
        assert!(!router.on_notification("ann,MSFT:2024-01-02:str").await.unwrap());
        assert_eq!(mem.rpop_many("pnl_queue:a", 10).await.unwrap(), vec![good]);
    }

    proptest! {
        #[test]
        fn watermark_never_moves_backward(stamps in proptest::collection::vec(0i64..1_000_000, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let mem = Arc::new(MemoryStore::new());
                let router = NotificationRouter::new(mem, RouterCfg::default());
                let mut prev = i64::MIN;
                let mut max = i64::MIN;
                for ts in stamps {
                    let wm = router.advance_watermark(ts).await.unwrap();
                    max = max.max(ts);
                    assert!(wm >= prev);
                    assert_eq!(wm, max);
                    prev = wm;
                }
            });
        }
    }
}
