// Ordering and convergence properties, driven through the real components.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveTime};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rust_decimal::Decimal;

use tradebook::aggregator::{AggregatorCfg, PositionAggregator};
use tradebook::domain::{
    parse_date, Lot, PairKey, Side, TradeRecord, TradeSubmission, POSITIONS_HASH, REALIZED_PNL_HASH,
};
use tradebook::ledger::LotLedger;
use tradebook::memstore::MemoryStore;
use tradebook::pnl::{PnlCfg, PnlShardWorker};
use tradebook::price::StaticPrices;
use tradebook::router::{NotificationRouter, RouterCfg};
use tradebook::shard::LetterRange;
use tradebook::store::{KeyOp, Store};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn record(account: &str, ticker: &str, side: Side, qty: i64, price: u32, secs: i64, id: usize) -> TradeRecord {
    let sub = TradeSubmission {
        account: account.into(),
        ticker: ticker.into(),
        price: Decimal::from(price),
        side,
        quantity: qty,
        action: "trade".into(),
    };
    let time = NaiveTime::from_hms_opt(9, 0, 0).unwrap() + ChronoDuration::seconds(secs);
    TradeRecord::from_submission(&sub, parse_date("2024-06-03").unwrap(), time, format!("t{id:03}"))
}

async fn write(store: &MemoryStore, rec: &TradeRecord) -> String {
    let key = rec.key.to_string();
    store.hset_many(&key, &rec.to_fields()).await.unwrap();
    key
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // trades discovered in arbitrary order replay into the same ledger as
    // chronological FIFO processing
    #[test]
    fn replay_matches_chronological_fifo(
        trades in proptest::collection::vec((any::<bool>(), 1i64..20, 50u32..150), 1..25),
        seed in any::<u64>(),
    ) {
        runtime().block_on(async {
            let mem = Arc::new(MemoryStore::new());
            let mut recs: Vec<TradeRecord> = trades
                .iter()
                .enumerate()
                .map(|(i, (buy, qty, px))| {
                    let side = if *buy { Side::Buy } else { Side::Sell };
                    record("pat", "T", side, *qty, *px, i as i64 * 7, i)
                })
                .collect();

            // oracle: FIFO in timestamp order
            let mut oracle = LotLedger::default();
            let mut realized = Decimal::ZERO;
            for r in &recs {
                match r.side {
                    Side::Buy => oracle.buy(Lot::from_record(r)),
                    Side::Sell => realized += oracle.sell(r.price, r.quantity).unwrap().realized,
                }
            }

            recs.shuffle(&mut StdRng::seed_from_u64(seed));
            for r in &recs {
                write(&mem, r).await;
            }

            let mut router = NotificationRouter::new(mem.clone(), RouterCfg::default());
            assert_eq!(router.replay_missed().await.unwrap(), recs.len());

            let worker = PnlShardWorker::new(
                mem.clone(),
                Arc::new(StaticPrices::parse_table("T=100")),
                "n-r".parse::<LetterRange>().unwrap(),
                PnlCfg::default(),
            );
            for key in mem.rpop_many("pnl_queue:p", 1000).await.unwrap() {
                worker.process_key(&key).await.unwrap();
            }

            let stored = mem
                .hget(REALIZED_PNL_HASH, "pat/T")
                .await
                .unwrap()
                .map(|v| Decimal::from_str(&v).unwrap())
                .unwrap_or_default();
            assert_eq!(stored, realized);
            let lots = mem.get("lots:pat/T").await.unwrap().map(|j| LotLedger::from_json(&j).unwrap());
            assert_eq!(lots.unwrap_or_default(), oracle);
        });
    }

    // duplicated and reordered notifications, or none at all plus the startup
    // sweep, all settle on the signed sum of quantities
    #[test]
    fn positions_converge_under_noisy_notifications(
        recs in proptest::collection::vec((0usize..3, 0usize..2, any::<bool>(), 1i64..50), 1..30),
        dupes in proptest::collection::vec(any::<prop::sample::Index>(), 0..60),
        reconcile_every in 1usize..10,
        lose_all in any::<bool>(),
        seed in any::<u64>(),
    ) {
        runtime().block_on(async {
            let accounts = ["amy", "ben", "zed"];
            let tickers = ["AAPL", "MSFT"];
            let mem = Arc::new(MemoryStore::new());
            let mut keys = Vec::new();
            let mut expected: HashMap<PairKey, i64> = HashMap::new();
            for (i, (a, t, buy, qty)) in recs.iter().enumerate() {
                let side = if *buy { Side::Buy } else { Side::Sell };
                let r = record(accounts[*a], tickers[*t], side, *qty, 10, i as i64, i);
                *expected.entry(r.pair().clone()).or_default() += r.signed_quantity();
                keys.push(write(&mem, &r).await);
            }

            let agg = PositionAggregator::new(mem.clone(), LetterRange::FULL, AggregatorCfg::default());
            if lose_all {
                agg.mark_all_dirty().await.unwrap();
            } else {
                let mut events = keys.clone();
                events.extend(dupes.iter().map(|ix| ix.get(&keys).clone()));
                events.shuffle(&mut StdRng::seed_from_u64(seed));
                for (i, k) in events.iter().enumerate() {
                    agg.on_event(k, KeyOp::HSet);
                    if i % reconcile_every == 0 {
                        agg.reconcile_once().await.unwrap();
                    }
                }
            }
            agg.reconcile_once().await.unwrap();

            for (pair, net) in expected {
                let got = mem.hget(POSITIONS_HASH, &pair.position_field()).await.unwrap();
                assert_eq!(got, Some(net.to_string()), "{pair}");
            }
        });
    }
}

#[tokio::test]
async fn one_record_moves_the_position_by_its_signed_quantity() {
    let mem = Arc::new(MemoryStore::new());
    let agg = PositionAggregator::new(mem.clone(), LetterRange::FULL, AggregatorCfg::default());
    let pair = PairKey::new("kim", "GOOG");
    write(&mem, &record("kim", "GOOG", Side::Buy, 40, 10, 0, 0)).await;
    let before = agg.reaggregate(&pair).await.unwrap().unwrap();

    write(&mem, &record("kim", "GOOG", Side::Sell, 15, 10, 1, 1)).await;
    assert_eq!(agg.reaggregate(&pair).await.unwrap(), Some(before - 15));

    write(&mem, &record("kim", "GOOG", Side::Buy, 7, 10, 2, 2)).await;
    assert_eq!(agg.reaggregate(&pair).await.unwrap(), Some(before - 15 + 7));
    assert_eq!(mem.hget(POSITIONS_HASH, "kim:GOOG").await.unwrap().as_deref(), Some("32"));
}
