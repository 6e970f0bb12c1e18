// ===============================
// src/lib.rs
// ===============================
//
// Trade booking, position reconciliation and FIFO PnL over a shared store.
//
//   submission log -> booker -> trade records ─┬─> aggregator (positions)
//                                              └─> router -> shard queues -> pnl workers
//
pub mod backoff;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod memstore;
pub mod metrics;
pub mod price;
pub mod query;
pub mod shard;
pub mod store;
pub mod submit;

pub mod aggregator;
pub mod booker;
pub mod pnl;
pub mod router;
