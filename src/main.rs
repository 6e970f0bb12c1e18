// ===============================
// src/main.rs
// ===============================
/*
 # whole pipeline in one process, a little synthetic load
 GENERATE=200 cargo run --release

 # only the PnL side, two shards
 COMPONENTS=router,pnl PNL_RANGES=a-m,n-z cargo run

 curl -s localhost:9898/metrics | egrep '^(trades_booked_total|keys_routed_total|pnl_trades_total)'
*/
use std::future::pending;
use std::sync::Arc;

use thiserror::Error;
use tokio::{
    select,
    task::JoinSet,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradebook::aggregator::PositionAggregator;
use tradebook::booker::TradeBooker;
use tradebook::config::{self, Component, ConfigError, PriceSource, Settings};
use tradebook::memstore::MemoryStore;
use tradebook::metrics;
use tradebook::pnl::PnlShardWorker;
use tradebook::price::{run_random_walk, HttpPriceFeed, PriceFeed, StaticPrices};
use tradebook::query;
use tradebook::router::NotificationRouter;
use tradebook::store::{wait_ready, SharedStore, StoreError};
use tradebook::submit;

#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[tokio::main]
async fn main() {
    // config first: it loads .env, which may carry RUST_LOG
    let settings = config::load();

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let res = match settings {
        Ok(s) => run(s).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = res {
        error!(error = %e, "tradebook failed to start");
        std::process::exit(1);
    }
}

fn build_prices(source: &PriceSource) -> Arc<dyn PriceFeed> {
    match source {
        PriceSource::Static { table, walk } => {
            let prices = Arc::new(StaticPrices::parse_table(table));
            if *walk {
                tokio::spawn(run_random_walk(prices.clone(), 25, Duration::from_secs(1)));
            }
            prices
        }
        PriceSource::Http { url } => Arc::new(HttpPriceFeed::new(url.clone())),
    }
}

async fn run(s: Settings) -> Result<(), StartupError> {
    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(s.metrics_port);

    // ---- Human-friendly startup info + export config to metrics ----
    let labels: Vec<&'static str> = s.components.iter().map(Component::label).collect();
    let agg_ranges: Vec<String> = s.aggregator_ranges.iter().map(|r| r.to_string()).collect();
    let pnl_ranges: Vec<String> = s.pnl_shards.ranges().iter().map(|r| r.to_string()).collect();
    info!(
        components = ?labels,
        bookers = s.bookers,
        aggregator_ranges = ?agg_ranges,
        pnl_ranges = ?pnl_ranges,
        stream = %s.booker.stream,
        group = %s.booker.group,
        price = ?s.price,
        "startup config"
    );
    for c in &s.components {
        let n = match c {
            Component::Booker => s.bookers as i64,
            Component::Aggregator => s.aggregator_ranges.len() as i64,
            Component::Router => 1,
            Component::Pnl => s.pnl_shards.ranges().len() as i64,
        };
        metrics::CONFIG_COMPONENT.with_label_values(&[c.label()]).set(n);
    }

    // ---- Store ----
    let store: SharedStore = Arc::new(MemoryStore::new());
    wait_ready(store.as_ref(), s.store_ready_timeout).await?;

    // ---- Components ----
    let mut tasks = JoinSet::new();

    if s.runs(Component::Booker) {
        for _ in 0..s.bookers {
            let booker = TradeBooker::new(store.clone(), s.booker.clone());
            // group exists before any producer writes
            booker.ensure_group().await?;
            tasks.spawn(booker.run());
        }
    }
    if s.runs(Component::Aggregator) {
        for range in &s.aggregator_ranges {
            tasks.spawn(PositionAggregator::new(store.clone(), *range, s.aggregator.clone()).run());
        }
    }
    if s.runs(Component::Router) {
        tasks.spawn(NotificationRouter::new(store.clone(), s.router.clone()).run());
    }
    if s.runs(Component::Pnl) {
        let prices = build_prices(&s.price);
        for range in s.pnl_shards.ranges() {
            tasks.spawn(PnlShardWorker::new(store.clone(), prices.clone(), *range, s.pnl.clone()).run());
        }
    }

    // ---- Producers ----
    for raw in &s.submit {
        submit::submit_raw(store.as_ref(), &s.booker.stream, raw).await?;
    }
    if s.generate > 0 {
        submit::enqueue_generated(store.as_ref(), &s.booker.stream, &s.generator, s.generate).await?;
    }

    // ---- Heartbeat / report ----
    let mut report = s.report_interval.map(|every| {
        let mut t = interval(every);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            Some(done) = tasks.join_next() => {
                match done {
                    Ok(()) => warn!("component task exited"),
                    Err(e) => error!(error = %e, "component task failed"),
                }
            }
            _ = async {
                match report.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => pending::<()>().await,
                }
            } => {
                if let Err(e) = query::log_report(store.as_ref()).await {
                    warn!(error = %e, "summary report failed");
                }
            }
        }
    }

    if let Err(e) = query::log_report(store.as_ref()).await {
        warn!(error = %e, "final summary failed");
    }
    tasks.shutdown().await;
    Ok(())
}
