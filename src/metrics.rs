// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Booking --------
pub static TRADES_BOOKED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_booked_total", "trade records written").unwrap());

pub static SUBMISSIONS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("submissions_rejected_total", "malformed submissions dropped and acked").unwrap()
});

pub static ENTRIES_RECLAIMED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("log_entries_reclaimed_total", "stale pending log entries claimed for rebooking").unwrap()
});

// -------- Position reconciliation --------
pub static POSITIONS_MARKED_DIRTY: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("positions_marked_dirty_total", "notifications that marked a pair dirty").unwrap()
});

pub static POSITIONS_REAGGREGATED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("positions_reaggregated_total", "full recomputations of a position").unwrap()
});

pub static DIRTY_SET_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("dirty_set_size", "pairs drained in the last cycle"), &["range"]).unwrap()
});

// -------- Notification routing --------
pub static KEYS_ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("keys_routed_total", "trade keys pushed to shard queues"), &["shard"])
        .unwrap()
});

pub static KEYS_REPLAYED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("keys_replayed_total", "trade keys re-queued by startup catch-up").unwrap()
});

pub static KEYS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("keys_ignored_total", "notifications that were not routable trade keys").unwrap()
});

pub static WATERMARK: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("router_watermark_ts", "highest routed trade timestamp").unwrap());

// -------- PnL workers --------
pub static PNL_TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("pnl_trades_total", "trades applied to lot ledgers"), &["side", "range"])
        .unwrap()
});

pub static PNL_MISROUTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("pnl_misroutes_total", "keys dropped for belonging to another shard"), &["range"])
        .unwrap()
});

pub static PNL_INCOMPLETE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pnl_incomplete_records_total", "keys skipped for missing or partial records").unwrap()
});

pub static PNL_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("pnl_keys_dropped_total", "keys dropped for unusable stored state"), &["reason"])
        .unwrap()
});

pub static PNL_OVERSELLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pnl_oversells_total", "sells that exceeded the open lots").unwrap()
});

pub static PRICE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("price_misses_total", "price lookups that failed"), &["ticker"]).unwrap()
});

pub static UNREALIZED_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("unrealized_updates_total", "unrealized PnL recomputations (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static INTERNAL_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("pnl_internal_queue_depth", "keys waiting for computation"), &["range"])
        .unwrap()
});

// Per-trade FIFO processing time (milliseconds)
pub static PNL_PROCESS_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("pnl_process_ms", "Time to apply one trade to its ledger (ms)"))
        .unwrap()
});

// -------- Store health --------
pub static STORE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("store_retries_total", "loop iterations backed off after a store error"), &["component"])
        .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_COMPONENT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_component", "running component instances (label: component)"),
        &["component"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TRADES_BOOKED.clone())),
        REGISTRY.register(Box::new(SUBMISSIONS_REJECTED.clone())),
        REGISTRY.register(Box::new(ENTRIES_RECLAIMED.clone())),
        REGISTRY.register(Box::new(POSITIONS_MARKED_DIRTY.clone())),
        REGISTRY.register(Box::new(POSITIONS_REAGGREGATED.clone())),
        REGISTRY.register(Box::new(DIRTY_SET_SIZE.clone())),
        REGISTRY.register(Box::new(KEYS_ROUTED.clone())),
        REGISTRY.register(Box::new(KEYS_REPLAYED.clone())),
        REGISTRY.register(Box::new(KEYS_IGNORED.clone())),
        REGISTRY.register(Box::new(WATERMARK.clone())),
        REGISTRY.register(Box::new(PNL_TRADES.clone())),
        REGISTRY.register(Box::new(PNL_MISROUTES.clone())),
        REGISTRY.register(Box::new(PNL_INCOMPLETE.clone())),
        REGISTRY.register(Box::new(PNL_DROPPED.clone())),
        REGISTRY.register(Box::new(PNL_OVERSELLS.clone())),
        REGISTRY.register(Box::new(PRICE_MISSES.clone())),
        REGISTRY.register(Box::new(UNREALIZED_WRITES.clone())),
        REGISTRY.register(Box::new(INTERNAL_QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(PNL_PROCESS_MS.clone())),
        REGISTRY.register(Box::new(STORE_RETRIES.clone())),
        REGISTRY.register(Box::new(CONFIG_COMPONENT.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) with a tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps the Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
