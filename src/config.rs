// ===============================
// src/config.rs
// ===============================
//
// Every knob is an env var (optionally from .env) with a default; startup
// flags override the env. `load()` turns the raw flags into typed per-component
// configs and refuses to start on a PnL shard layout that does not tile a..=z.
//
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

use crate::aggregator::AggregatorCfg;
use crate::booker::BookerCfg;
use crate::pnl::PnlCfg;
use crate::router::RouterCfg;
use crate::shard::{parse_ranges, LetterRange, ShardError, ShardMap};
use crate::submit::GeneratorCfg;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown component {0:?} (expected booker, aggregator, router or pnl)")]
    Component(String),
    #[error("no components selected")]
    NoComponents,
    #[error("{which}: {source}")]
    Shards {
        which: &'static str,
        #[source]
        source: ShardError,
    },
}

/// Long-running pieces a process can host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Booker,
    Aggregator,
    Router,
    Pnl,
}

impl Component {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "booker" | "trade_booker" | "tb" => Some(Component::Booker),
            "aggregator" | "position_aggregator" | "pa" => Some(Component::Aggregator),
            "router" | "listener" | "notification_router" | "nr" => Some(Component::Router),
            "pnl" | "pnl_worker" | "pnl_calculator" => Some(Component::Pnl),
            _ => None,
        }
    }

    /// `"booker,router"` -> [Booker, Router]; unknown names are an error.
    pub fn parse_many(s: &str) -> Result<Vec<Self>, ConfigError> {
        let mut out = Vec::new();
        for t in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let c = Self::parse_one(t).ok_or_else(|| ConfigError::Component(t.to_string()))?;
            if !out.contains(&c) {
                out.push(c);
            }
        }
        if out.is_empty() {
            return Err(ConfigError::NoComponents);
        }
        Ok(out)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Component::Booker => "booker",
            Component::Aggregator => "aggregator",
            Component::Router => "router",
            Component::Pnl => "pnl",
        }
    }
}

/// Where the PnL workers get live prices from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PriceSource {
    Static { table: String, walk: bool },
    Http { url: String },
}

#[derive(Parser, Clone, Debug)]
#[command(name = "tradebook", version, about = "Trade booking, position reconciliation and FIFO PnL pipeline")]
pub struct Cli {
    /// Components to run in this process (booker,aggregator,router,pnl)
    #[arg(long, env = "COMPONENTS", default_value = "booker,aggregator,router,pnl")]
    pub components: String,

    /// Booker instances sharing the consumer group
    #[arg(long, env = "BOOKERS", default_value_t = 1)]
    pub bookers: u32,

    /// Letter ranges owned by position aggregators, one instance each
    #[arg(long, env = "AGGREGATOR_RANGES", default_value = "a-z")]
    pub aggregator_ranges: String,

    /// Letter ranges owned by PnL workers; must tile a-z
    #[arg(long, env = "PNL_RANGES", default_value = "a-f,g-l,m-r,s-z")]
    pub pnl_ranges: String,

    #[arg(long, env = "STREAM_KEY", default_value = "trades_stream")]
    pub stream_key: String,

    #[arg(long, env = "CONSUMER_GROUP", default_value = "booker-group")]
    pub consumer_group: String,

    #[arg(long, env = "BOOKER_BATCH", default_value_t = 1000)]
    pub booker_batch: usize,

    #[arg(long, env = "BOOKER_BLOCK_MS", default_value_t = 5000)]
    pub booker_block_ms: u64,

    /// Pending entries idle this long are reclaimed by a live booker
    #[arg(long, env = "BOOKER_CLAIM_IDLE_MS", default_value_t = 30_000)]
    pub booker_claim_idle_ms: u64,

    #[arg(long, env = "RECONCILE_INTERVAL_MS", default_value_t = 1000)]
    pub reconcile_interval_ms: u64,

    #[arg(long, env = "PNL_POP_TIMEOUT_MS", default_value_t = 1000)]
    pub pnl_pop_timeout_ms: u64,

    #[arg(long, env = "PNL_MAX_BATCH", default_value_t = 1000)]
    pub pnl_max_batch: usize,

    #[arg(long, env = "PNL_INTERNAL_QUEUE", default_value_t = 10_000)]
    pub pnl_internal_queue: usize,

    #[arg(long, env = "PRICE_TIMEOUT_MS", default_value_t = 2000)]
    pub price_timeout_ms: u64,

    /// Static price table; the default prices every default generated ticker
    #[arg(long, env = "PRICES", default_value = "AAPL=150,MSFT=300,GOOG=140")]
    pub prices: String,

    /// Random-walk the static price table (mock market)
    #[arg(long, env = "PRICE_WALK", default_value_t = false)]
    pub price_walk: bool,

    /// HTTP price endpoint with a {ticker} placeholder; overrides PRICES
    #[arg(long, env = "PRICE_URL")]
    pub price_url: Option<String>,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// Seconds between positions/PnL summary logs (0 disables)
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value_t = 10)]
    pub report_interval_secs: u64,

    #[arg(long, env = "STORE_READY_TIMEOUT_SECS", default_value_t = 60)]
    pub store_ready_timeout_secs: u64,

    /// Submission strings to enqueue at startup (repeatable)
    #[arg(long = "submit")]
    pub submit: Vec<String>,

    /// Synthetic submissions to enqueue at startup
    #[arg(long, env = "GENERATE", default_value_t = 0)]
    pub generate: usize,

    #[arg(long, env = "GEN_ACCOUNTS", default_value = "alice,bob,charlie,diblaim,nancy,zoe")]
    pub gen_accounts: String,

    #[arg(long, env = "GEN_TICKERS", default_value = "AAPL,MSFT,GOOG")]
    pub gen_tickers: String,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub components: Vec<Component>,
    pub bookers: u32,
    pub aggregator_ranges: Vec<LetterRange>,
    pub pnl_shards: ShardMap,
    pub booker: BookerCfg,
    pub aggregator: AggregatorCfg,
    pub router: RouterCfg,
    pub pnl: PnlCfg,
    pub price: PriceSource,
    pub metrics_port: u16,
    pub report_interval: Option<Duration>,
    pub store_ready_timeout: Duration,
    pub submit: Vec<String>,
    pub generate: usize,
    pub generator: GeneratorCfg,
}

impl Settings {
    pub fn runs(&self, c: Component) -> bool {
        self.components.contains(&c)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}

/// Loads .env, parses flags/env and builds typed settings.
pub fn load() -> Result<Settings, ConfigError> {
    // make sure .env is read before clap looks at the environment
    let _ = dotenv();
    from_cli(Cli::parse())
}

pub fn from_cli(cli: Cli) -> Result<Settings, ConfigError> {
    let components = Component::parse_many(&cli.components)?;

    let aggregator_ranges = parse_ranges(&cli.aggregator_ranges)
        .map_err(|source| ConfigError::Shards { which: "AGGREGATOR_RANGES", source })?;
    let pnl_shards = parse_ranges(&cli.pnl_ranges)
        .and_then(ShardMap::new)
        .map_err(|source| ConfigError::Shards { which: "PNL_RANGES", source })?;

    let booker = BookerCfg {
        stream: cli.stream_key.clone(),
        group: cli.consumer_group.clone(),
        batch: cli.booker_batch.max(1),
        block: Duration::from_millis(cli.booker_block_ms),
        claim_idle: Duration::from_millis(cli.booker_claim_idle_ms),
        ..BookerCfg::default()
    };
    let aggregator = AggregatorCfg {
        interval: Duration::from_millis(cli.reconcile_interval_ms.max(1)),
        ..AggregatorCfg::default()
    };
    let pnl = PnlCfg {
        pop_timeout: Duration::from_millis(cli.pnl_pop_timeout_ms.max(1)),
        max_batch: cli.pnl_max_batch.max(1),
        internal_queue: cli.pnl_internal_queue.max(1),
        price_timeout: Duration::from_millis(cli.price_timeout_ms.max(1)),
    };
    let price = match cli.price_url.filter(|u| !u.trim().is_empty()) {
        Some(url) => PriceSource::Http { url },
        None => PriceSource::Static { table: cli.prices.clone(), walk: cli.price_walk },
    };
    let generator = GeneratorCfg {
        accounts: split_list(&cli.gen_accounts),
        tickers: split_list(&cli.gen_tickers).into_iter().map(|t| t.to_ascii_uppercase()).collect(),
        ..GeneratorCfg::default()
    };

    Ok(Settings {
        components,
        bookers: cli.bookers.max(1),
        aggregator_ranges,
        pnl_shards,
        booker,
        aggregator,
        router: RouterCfg::default(),
        pnl,
        price,
        metrics_port: cli.metrics_port,
        report_interval: (cli.report_interval_secs > 0).then(|| Duration::from_secs(cli.report_interval_secs)),
        store_ready_timeout: Duration::from_secs(cli.store_ready_timeout_secs),
        submit: cli.submit,
        generate: cli.generate,
        generator,
    })
}
