// ===============================
// src/booker.rs (TradeBooker)
// ===============================
//
// Consumer-group reader of the submission log. Each entry becomes one
// immutable TradeRecord; record fields, accounts set, booked counter and the
// log ack go out as one pipeline. Malformed submissions are acked and dropped.
//
// Delivery is at-least-once: the trade id is minted here, so an entry that is
// redelivered after a crash (reclaimed below) is booked a second time under a
// new id.
//
use chrono::{DateTime, Timelike, Utc};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::domain::{TradeKey, TradeRecord, TradeSubmission, ACCOUNTS_SET, BOOKED_COUNTER, SUBMISSION_FIELD};
use crate::metrics::{ENTRIES_RECLAIMED, SUBMISSIONS_REJECTED, TRADES_BOOKED};
use crate::store::{SharedStore, StreamEntry, StoreError, WriteOp};

#[derive(Debug, Clone)]
pub struct BookerCfg {
    pub stream: String,
    pub group: String,
    /// Max entries per read.
    pub batch: usize,
    /// How long one read may block waiting for entries.
    pub block: Duration,
    /// Pending entries idle this long belong to a dead consumer.
    pub claim_idle: Duration,
    /// How often to look for such entries.
    pub claim_every: Duration,
    /// Throughput log cadence, in bookings.
    pub log_every: u64,
}

impl Default for BookerCfg {
    fn default() -> Self {
        Self {
            stream: "trades_stream".into(),
            group: "booker-group".into(),
            batch: 1000,
            block: Duration::from_millis(5000),
            claim_idle: Duration::from_millis(30_000),
            claim_every: Duration::from_secs(10),
            log_every: 1000,
        }
    }
}

pub struct TradeBooker {
    store: SharedStore,
    cfg: BookerCfg,
    consumer: String,
    booked: u64,
    window_start: Instant,
}

impl TradeBooker {
    pub fn new(store: SharedStore, cfg: BookerCfg) -> Self {
        let consumer = format!("booker-consumer-{}", Uuid::new_v4());
        Self { store, cfg, consumer, booked: 0, window_start: Instant::now() }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn booked(&self) -> u64 {
        self.booked
    }

    /// Creates the consumer group (and stream) unless it already exists.
    pub async fn ensure_group(&self) -> Result<(), StoreError> {
        if self.store.xgroup_create(&self.cfg.stream, &self.cfg.group).await? {
            info!(stream = %self.cfg.stream, group = %self.cfg.group, "consumer group created");
        } else {
            debug!(stream = %self.cfg.stream, group = %self.cfg.group, "consumer group already exists");
        }
        Ok(())
    }

    /// Books one log entry at server time `now`. Returns the new record key,
    /// or `None` when the submission was rejected (and acked).
    pub async fn book_entry(&self, entry: &StreamEntry, now: DateTime<Utc>) -> Result<Option<TradeKey>, StoreError> {
        let ack = WriteOp::XAck { stream: self.cfg.stream.clone(), group: self.cfg.group.clone(), id: entry.id };

        let raw = entry.fields.get(SUBMISSION_FIELD).map(String::as_str).unwrap_or_default();
        let sub = match raw.parse::<TradeSubmission>() {
            Ok(s) => s,
            Err(e) => {
                warn!(id = entry.id, raw = %raw, error = %e, "dropping malformed submission");
                SUBMISSIONS_REJECTED.inc();
                self.store.pipeline(vec![ack]).await?;
                return Ok(None);
            }
        };

        let time = now.time().with_nanosecond(0).unwrap_or_else(|| now.time());
        let rec = TradeRecord::from_submission(&sub, now.date_naive(), time, Uuid::new_v4().to_string())
            .with_seq(entry.id);
        let key = rec.key.to_string();

        self.store
            .pipeline(vec![
                WriteOp::HSet { key: key.clone(), fields: rec.to_fields() },
                WriteOp::SAdd { key: ACCOUNTS_SET.into(), member: sub.account.clone() },
                WriteOp::Incr { key: BOOKED_COUNTER.into() },
                ack,
            ])
            .await?;
        TRADES_BOOKED.inc();
        debug!(%key, side = %sub.side, qty = sub.quantity, "trade booked");
        Ok(Some(rec.key))
    }

    /// Books a batch in log order. Stops at the first store error; the rest of
    /// the batch stays pending and is redelivered through a reclaim.
    pub async fn book_batch(&mut self, entries: &[StreamEntry]) -> Result<usize, StoreError> {
        let mut n = 0usize;
        for entry in entries {
            if self.book_entry(entry, Utc::now()).await?.is_some() {
                n += 1;
                self.booked += 1;
                if self.booked % self.cfg.log_every.max(1) == 0 {
                    let secs = self.window_start.elapsed().as_secs_f64().max(1e-6);
                    let per_sec = (self.cfg.log_every as f64 / secs).round();
                    info!(consumer = %self.consumer, booked = self.booked, per_sec, "booking throughput");
                    self.window_start = Instant::now();
                }
            }
        }
        Ok(n)
    }

    /// Claims entries left pending by consumers that stopped acknowledging.
    pub async fn reclaim_stale(&mut self) -> Result<usize, StoreError> {
        let claimed = self
            .store
            .xautoclaim(&self.cfg.stream, &self.cfg.group, &self.consumer, self.cfg.claim_idle, self.cfg.batch)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        warn!(consumer = %self.consumer, count = claimed.len(), "reclaimed stale log entries, rebooking");
        ENTRIES_RECLAIMED.inc_by(claimed.len() as u64);
        self.book_batch(&claimed).await
    }

    /// One read-and-book iteration (blocks up to `block` for new entries).
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        let entries = self
            .store
            .xreadgroup(&self.cfg.stream, &self.cfg.group, &self.consumer, self.cfg.batch, self.cfg.block)
            .await?;
        self.book_batch(&entries).await
    }

    pub async fn run(mut self) {
        info!(
            consumer = %self.consumer,
            stream = %self.cfg.stream,
            group = %self.cfg.group,
            batch = self.cfg.batch,
            "trade booker started"
        );
        let mut backoff = Backoff::default();
        let mut last_claim: Option<Instant> = None;

        loop {
            if let Err(e) = self.ensure_group().await {
                warn!(error = %e, "cannot create consumer group");
                backoff.wait("booker").await;
                continue;
            }
            break;
        }
        backoff.reset();

        loop {
            let claim_due = last_claim.map_or(true, |t| t.elapsed() >= self.cfg.claim_every);
            let res = if claim_due {
                last_claim = Some(Instant::now());
                self.reclaim_stale().await
            } else {
                self.poll_once().await
            };

            match res {
                Ok(_) => backoff.reset(),
                Err(StoreError::NoGroup { .. }) => {
                    warn!(group = %self.cfg.group, "consumer group vanished, recreating");
                    if self.ensure_group().await.is_err() {
                        backoff.wait("booker").await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "booker iteration failed");
                    backoff.wait("booker").await;
                }
            }
        }
    }
}
