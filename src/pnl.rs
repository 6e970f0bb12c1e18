// ===============================
// src/pnl.rs (PnLShardWorker)
// ===============================
//
// One worker per letter range. Two tasks joined by a bounded channel:
//   ingest : BRPOP on the range's shard queues, then drain what is already
//            queued (bounded batch) into the channel
//   compute: per key, load record -> FIFO ledger update -> realized/unrealized
//
// Static sharding means no other worker ever touches these ledgers, so the
// read-modify-write of a lot list needs no lock.
//
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::domain::{
    shard_queue_key, Lot, PairKey, Side, TradeKey, TradeRecord, REALIZED_PNL_HASH, UNREALIZED_PNL_HASH,
};
use crate::ledger::{LotLedger, SellOutcome};
use crate::metrics::{
    INTERNAL_QUEUE_DEPTH, PNL_DROPPED, PNL_INCOMPLETE, PNL_MISROUTES, PNL_OVERSELLS, PNL_PROCESS_MS, PNL_TRADES,
    UNREALIZED_WRITES,
};
use crate::price::{price_with_timeout, PriceFeed};
use crate::shard::LetterRange;
use crate::store::{SharedStore, StoreError};

/// Smallest unrealized change worth a write.
const UNREALIZED_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone)]
pub struct PnlCfg {
    pub pop_timeout: Duration,
    /// Keys taken per ingestion round, the blocking pop included.
    pub max_batch: usize,
    pub internal_queue: usize,
    pub price_timeout: Duration,
}

impl Default for PnlCfg {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_millis(1000),
            max_batch: 1000,
            internal_queue: 10_000,
            price_timeout: Duration::from_millis(2000),
        }
    }
}

/// What processing one key did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Buy { open_lots: usize },
    Sell(SellOutcome),
    /// Account outside this worker's range.
    Misrouted,
    /// Record missing, unreadable or incomplete, or a ledger that cannot be
    /// read or updated.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrealizedUpdate {
    Written(Decimal),
    Unchanged,
    PriceUnavailable,
    /// Mark-to-market does not fit a `Decimal`; the stored value is kept.
    Overflow,
}

#[derive(Clone)]
pub struct PnlShardWorker {
    store: SharedStore,
    prices: Arc<dyn PriceFeed>,
    range: LetterRange,
    label: String,
    cfg: PnlCfg,
}

impl PnlShardWorker {
    pub fn new(store: SharedStore, prices: Arc<dyn PriceFeed>, range: LetterRange, cfg: PnlCfg) -> Self {
        Self { store, prices, range, label: range.to_string(), cfg }
    }

    pub fn range(&self) -> LetterRange {
        self.range
    }

    pub fn queue_keys(&self) -> Vec<String> {
        self.range.letters().map(shard_queue_key).collect()
    }

    /// Waits up to `pop_timeout` for one key, then drains up to
    /// `max_batch - 1` more already queued behind it. Oldest first.
    pub async fn pull_batch(&self, queues: &[String]) -> Result<Vec<String>, StoreError> {
        let Some((queue, first)) = self.store.brpop(queues, self.cfg.pop_timeout).await? else {
            return Ok(Vec::new());
        };
        let mut batch = vec![first];
        let extra = self.cfg.max_batch.saturating_sub(1);
        if extra > 0 {
            batch.extend(self.store.rpop_many(&queue, extra).await?);
        }
        Ok(batch)
    }

    async fn load_ledger(&self, pair: &PairKey) -> Result<LotLedger, StoreError> {
        let key = pair.lots_key();
        match self.store.get(&key).await? {
            None => Ok(LotLedger::default()),
            Some(json) => LotLedger::from_json(&json).map_err(|_| StoreError::Decode { key, expected: "lot list" }),
        }
    }

    async fn save_ledger(&self, pair: &PairKey, ledger: &LotLedger) -> Result<(), StoreError> {
        let key = pair.lots_key();
        let json = ledger
            .to_json()
            .map_err(|_| StoreError::Decode { key: key.clone(), expected: "lot list" })?;
        self.store.set(&key, &json).await
    }

    /// Applies one routed trade key to its pair's ledger.
    ///
    /// Errors before the lot list is persisted leave no trace and the key can
    /// be retried as a whole. After that point the realized increment is
    /// retried in place so a retry never applies the same sell twice.
    pub async fn process_key(&self, raw: &str) -> Result<Applied, StoreError> {
        let Ok(key) = raw.parse::<TradeKey>() else {
            warn!(key = %raw, range = %self.label, "not a trade key, dropping");
            PNL_INCOMPLETE.inc();
            return Ok(Applied::Skipped);
        };
        if !self.range.owns_account(key.account()) {
            warn!(key = %raw, range = %self.label, "key outside this shard, dropping");
            PNL_MISROUTES.with_label_values(&[&self.label]).inc();
            return Ok(Applied::Misrouted);
        }

        let fields = match self.store.hgetall(raw).await {
            Ok(f) => f,
            Err(e) if !e.is_transient() => return Ok(self.drop_key(raw, "unreadable", &e)),
            Err(e) => return Err(e),
        };
        if fields.is_empty() {
            warn!(key = %raw, "trade record not found, skipping");
            PNL_INCOMPLETE.inc();
            return Ok(Applied::Skipped);
        }
        let rec = match TradeRecord::from_fields(key, &fields) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %raw, error = %e, "incomplete trade record, skipping");
                PNL_INCOMPLETE.inc();
                return Ok(Applied::Skipped);
            }
        };

        let started = StdInstant::now();
        let pair = rec.pair().clone();
        let mut ledger = match self.load_ledger(&pair).await {
            Ok(l) => l,
            Err(e) if !e.is_transient() => return Ok(self.drop_key(raw, "unreadable", &e)),
            Err(e) => return Err(e),
        };

        let applied = match rec.side {
            Side::Buy => {
                ledger.buy(Lot::from_record(&rec));
                self.save_ledger(&pair, &ledger).await?;
                Applied::Buy { open_lots: ledger.lots().len() }
            }
            Side::Sell => {
                if ledger.is_empty() {
                    warn!(pair = %pair, qty = rec.quantity, "sell with no open lots");
                }
                let out = match ledger.sell(rec.price, rec.quantity) {
                    Ok(out) => out,
                    Err(e) => return Ok(self.drop_key(raw, "overflow", &e)),
                };
                self.save_ledger(&pair, &ledger).await?;
                if out.matched > 0 {
                    self.add_realized(&pair, out.realized).await;
                }
                if out.unresolved > 0 {
                    warn!(
                        pair = %pair,
                        sold = rec.quantity,
                        unresolved = out.unresolved,
                        "oversell: remainder left unresolved"
                    );
                    PNL_OVERSELLS.inc();
                }
                Applied::Sell(out)
            }
        };
        PNL_TRADES.with_label_values(&[rec.side.as_str(), &self.label]).inc();

        if let Err(e) = self.refresh_unrealized(&pair, &ledger).await {
            warn!(pair = %pair, error = %e, "unrealized update failed, next trade recomputes it");
        }
        PNL_PROCESS_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
        debug!(key = %raw, ?applied, "trade applied");
        Ok(applied)
    }

    fn drop_key(&self, raw: &str, reason: &'static str, error: &dyn std::error::Error) -> Applied {
        warn!(key = %raw, range = %self.label, reason, %error, "trade key dropped");
        PNL_DROPPED.with_label_values(&[reason]).inc();
        Applied::Skipped
    }

    async fn add_realized(&self, pair: &PairKey, realized: Decimal) {
        let field = pair.pnl_field();
        let mut backoff = Backoff::default();
        loop {
            match self.store.hincr_decimal(REALIZED_PNL_HASH, &field, realized).await {
                Ok(total) => {
                    debug!(pair = %pair, %realized, %total, "realized pnl updated");
                    return;
                }
                Err(e) => {
                    warn!(pair = %pair, error = %e, "realized increment failed, retrying");
                    backoff.wait("pnl").await;
                }
            }
        }
    }

    /// Marks the open lots to market. Writes only when the value moves by more
    /// than a cent; a price miss keeps the previous value.
    pub async fn refresh_unrealized(&self, pair: &PairKey, ledger: &LotLedger) -> Result<UnrealizedUpdate, StoreError> {
        let value = if ledger.is_empty() {
            Decimal::ZERO
        } else {
            match price_with_timeout(self.prices.as_ref(), &pair.ticker, self.cfg.price_timeout).await {
                Ok(px) => match ledger.unrealized(px) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(pair = %pair, %px, error = %e, "unrealized pnl out of range, left as is");
                        UNREALIZED_WRITES.with_label_values(&["overflow"]).inc();
                        return Ok(UnrealizedUpdate::Overflow);
                    }
                },
                Err(e) => {
                    warn!(pair = %pair, error = %e, "no live price, unrealized pnl left as is");
                    UNREALIZED_WRITES.with_label_values(&["price_miss"]).inc();
                    return Ok(UnrealizedUpdate::PriceUnavailable);
                }
            }
        };

        let write = move |cur: Option<&str>| {
            let old = cur.and_then(|v| Decimal::from_str(v).ok()).unwrap_or_default();
            ((value - old).abs() > UNREALIZED_EPSILON).then(|| value.normalize().to_string())
        };
        if self.store.hupdate(UNREALIZED_PNL_HASH, &pair.pnl_field(), &write).await? {
            UNREALIZED_WRITES.with_label_values(&["written"]).inc();
            Ok(UnrealizedUpdate::Written(value))
        } else {
            UNREALIZED_WRITES.with_label_values(&["unchanged"]).inc();
            Ok(UnrealizedUpdate::Unchanged)
        }
    }

    async fn ingest(self, tx: mpsc::Sender<String>) {
        let queues = self.queue_keys();
        let mut backoff = Backoff::default();
        loop {
            match self.pull_batch(&queues).await {
                Ok(batch) => {
                    backoff.reset();
                    for key in batch {
                        if tx.send(key).await.is_err() {
                            warn!(range = %self.label, "compute task gone, ingestion stopped");
                            return;
                        }
                    }
                    INTERNAL_QUEUE_DEPTH
                        .with_label_values(&[&self.label])
                        .set((tx.max_capacity() - tx.capacity()) as i64);
                }
                Err(e) => {
                    warn!(range = %self.label, error = %e, "shard queue pop failed");
                    backoff.wait("pnl").await;
                }
            }
        }
    }

    async fn compute(self, mut rx: mpsc::Receiver<String>) {
        let mut backoff = Backoff::default();
        while let Some(key) = rx.recv().await {
            loop {
                match self.process_key(&key).await {
                    Ok(_) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(key = %key, error = %e, "trade processing failed, retrying");
                        backoff.wait("pnl").await;
                    }
                    Err(e) => {
                        self.drop_key(&key, "store_error", &e);
                        break;
                    }
                }
            }
        }
    }

    pub async fn run(self) {
        info!(
            range = %self.label,
            queues = self.queue_keys().len(),
            max_batch = self.cfg.max_batch,
            "pnl shard worker started"
        );
        let (tx, rx) = mpsc::channel::<String>(self.cfg.internal_queue.max(1));
        let ingest = tokio::spawn(self.clone().ingest(tx));
        self.compute(rx).await;
        ingest.abort();
    }
}
