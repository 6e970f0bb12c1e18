// ===============================
// src/submit.rs (submission producer)
// ===============================
use ahash::AHashMap as HashMap;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::info;

use crate::domain::{PairKey, Side, TradeSubmission, SUBMISSION_FIELD};
use crate::store::{Store, StoreError};

/// Appends one raw submission string to the ingestion log. Validation is the
/// booker's job; a bad string is dropped there.
pub async fn submit_raw(store: &dyn Store, stream: &str, raw: &str) -> Result<u64, StoreError> {
    store
        .xadd(stream, &[(SUBMISSION_FIELD.to_string(), raw.to_string())])
        .await
}

pub async fn submit(store: &dyn Store, stream: &str, sub: &TradeSubmission) -> Result<u64, StoreError> {
    submit_raw(store, stream, &sub.to_string()).await
}

/// Synthetic load shape.
#[derive(Debug, Clone)]
pub struct GeneratorCfg {
    pub accounts: Vec<String>,
    pub tickers: Vec<String>,
    /// Price bounds in cents.
    pub min_cents: i64,
    pub max_cents: i64,
    pub max_qty: i64,
    /// Chance of a sell when something is held.
    pub sell_ratio: f64,
}

impl Default for GeneratorCfg {
    fn default() -> Self {
        Self {
            accounts: vec!["alice".into(), "bob".into(), "nancy".into(), "zoe".into()],
            tickers: vec!["AAPL".into(), "MSFT".into(), "GOOG".into()],
            min_cents: 10_000,
            max_cents: 50_000,
            max_qty: 100,
            sell_ratio: 0.4,
        }
    }
}

/// `n` random submissions. Sells never exceed what earlier generated trades
/// left open for the pair.
pub fn generate<R: Rng>(cfg: &GeneratorCfg, n: usize, rng: &mut R) -> Vec<TradeSubmission> {
    if cfg.accounts.is_empty() || cfg.tickers.is_empty() {
        return Vec::new();
    }
    let mut held: HashMap<PairKey, i64> = HashMap::new();
    let (lo, hi) = (cfg.min_cents.max(1), cfg.max_cents.max(cfg.min_cents.max(1)));
    let mut out = Vec::with_capacity(n);

    for _ in 0..n {
        let account = &cfg.accounts[rng.gen_range(0..cfg.accounts.len())];
        let ticker = &cfg.tickers[rng.gen_range(0..cfg.tickers.len())];
        let pair = PairKey::new(account.clone(), ticker.clone());
        let open = held.entry(pair).or_insert(0);

        let (side, quantity) = if *open > 0 && rng.gen_bool(cfg.sell_ratio.clamp(0.0, 1.0)) {
            (Side::Sell, rng.gen_range(1..=*open))
        } else {
            (Side::Buy, rng.gen_range(1..=cfg.max_qty.max(1)))
        };
        *open += side.sign() * quantity;

        out.push(TradeSubmission {
            account: account.clone(),
            ticker: ticker.clone(),
            price: Decimal::new(rng.gen_range(lo..=hi), 2).normalize(),
            side,
            quantity,
            action: "trade".into(),
        });
    }
    out
}

/// Generates and enqueues `n` submissions.
pub async fn enqueue_generated(store: &dyn Store, stream: &str, cfg: &GeneratorCfg, n: usize) -> Result<usize, StoreError> {
    // ThreadRng is !Send; build the batch before the first await
    let batch = generate(cfg, n, &mut rand::thread_rng());
    for sub in &batch {
        submit(store, stream, sub).await?;
    }
    info!(count = batch.len(), stream, "synthetic submissions enqueued");
    Ok(batch.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generator_never_oversells() {
        let cfg = GeneratorCfg::default();
        let mut rng = StdRng::seed_from_u64(7);
        let subs = generate(&cfg, 2000, &mut rng);
        assert_eq!(subs.len(), 2000);

        let mut held: HashMap<PairKey, i64> = HashMap::new();
        let mut sells = 0;
        for s in &subs {
            let h = held.entry(s.pair()).or_insert(0);
            *h += s.side.sign() * s.quantity;
            assert!(*h >= 0, "oversold {s}");
            if s.side == Side::Sell {
                sells += 1;
            }
            // every generated string survives the booker's parser
            assert_eq!(s.to_string().parse::<TradeSubmission>().unwrap(), *s);
        }
        assert!(sells > 0);
    }

    #[tokio::test]
    async fn submit_appends_to_log() {
        let mem = MemoryStore::new();
        mem.xgroup_create("s", "g").await.unwrap();
        let sub: TradeSubmission = "alice,AAPL:150:buy:100:trade".parse().unwrap();
        submit(&mem, "s", &sub).await.unwrap();
        submit_raw(&mem, "s", "not a trade").await.unwrap();
        let got = mem
            .xreadgroup("s", "g", "c", 10, std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].fields[SUBMISSION_FIELD], "alice,AAPL:150:buy:100:trade");
    }
}
