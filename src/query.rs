// ===============================
// src/query.rs (read side)
// ===============================
//
// Position and PnL lookups over the aggregate hashes. Values are rounded to
// cents on the way out; what is stored stays exact.
//
use std::collections::BTreeSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::domain::{PairKey, BOOKED_COUNTER, POSITIONS_HASH, REALIZED_PNL_HASH, UNREALIZED_PNL_HASH};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PnlSummary {
    pub account: String,
    pub ticker: String,
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub total: Decimal,
}

impl PnlSummary {
    fn new(pair: &PairKey, realized: Decimal, unrealized: Decimal) -> Self {
        Self {
            account: pair.account.clone(),
            ticker: pair.ticker.clone(),
            realized: realized.round_dp(2),
            unrealized: unrealized.round_dp(2),
            total: (realized + unrealized).round_dp(2),
        }
    }
}

fn decimal(hash: &str, field: &str, v: Option<&String>) -> Result<Decimal, StoreError> {
    match v {
        None => Ok(Decimal::ZERO),
        Some(s) => Decimal::from_str(s)
            .map_err(|_| StoreError::Decode { key: format!("{hash}/{field}"), expected: "decimal" }),
    }
}

fn split_field(field: &str, sep: char) -> Option<PairKey> {
    let (a, t) = field.split_once(sep)?;
    Some(PairKey::new(a, t))
}

/// Realized, unrealized and total PnL of one pair (zero when never traded).
pub async fn ticker_pnl(store: &dyn Store, pair: &PairKey) -> Result<PnlSummary, StoreError> {
    let field = pair.pnl_field();
    let r = store.hget(REALIZED_PNL_HASH, &field).await?;
    let u = store.hget(UNREALIZED_PNL_HASH, &field).await?;
    Ok(PnlSummary::new(
        pair,
        decimal(REALIZED_PNL_HASH, &field, r.as_ref())?,
        decimal(UNREALIZED_PNL_HASH, &field, u.as_ref())?,
    ))
}

async fn collect(store: &dyn Store, account: Option<&str>) -> Result<Vec<PnlSummary>, StoreError> {
    let realized = store.hgetall(REALIZED_PNL_HASH).await?;
    let unrealized = store.hgetall(UNREALIZED_PNL_HASH).await?;
    let fields: BTreeSet<&String> = realized.keys().chain(unrealized.keys()).collect();

    let mut out = Vec::new();
    for f in fields {
        let Some(pair) = split_field(f, '/') else { continue };
        if account.is_some_and(|a| a != pair.account) {
            continue;
        }
        out.push(PnlSummary::new(
            &pair,
            decimal(REALIZED_PNL_HASH, f, realized.get(f))?,
            decimal(UNREALIZED_PNL_HASH, f, unrealized.get(f))?,
        ));
    }
    Ok(out)
}

/// Every ticker an account has PnL for, sorted by ticker.
pub async fn account_pnls(store: &dyn Store, account: &str) -> Result<Vec<PnlSummary>, StoreError> {
    collect(store, Some(account)).await
}

/// Every (account, ticker) with PnL, sorted.
pub async fn all_pnls(store: &dyn Store) -> Result<Vec<PnlSummary>, StoreError> {
    collect(store, None).await
}

/// Current positions, sorted by pair.
pub async fn positions(store: &dyn Store) -> Result<Vec<(PairKey, i64)>, StoreError> {
    let mut out = Vec::new();
    for (field, v) in store.hgetall(POSITIONS_HASH).await? {
        let Some(pair) = split_field(&field, ':') else { continue };
        let qty = v
            .parse::<i64>()
            .map_err(|_| StoreError::Decode { key: format!("{POSITIONS_HASH}/{field}"), expected: "integer" })?;
        out.push((pair, qty));
    }
    out.sort();
    Ok(out)
}

pub async fn booked_count(store: &dyn Store) -> Result<i64, StoreError> {
    Ok(store
        .get(BOOKED_COUNTER)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// One summary log line per pair with an open position or PnL.
pub async fn log_report(store: &dyn Store) -> Result<(), StoreError> {
    let booked = booked_count(store).await?;
    let positions = positions(store).await?;
    let pnls = all_pnls(store).await?;
    let realized: Decimal = pnls.iter().map(|p| p.realized).sum();
    let unrealized: Decimal = pnls.iter().map(|p| p.unrealized).sum();
    info!(booked, pairs = positions.len(), %realized, %unrealized, "book summary");
    for (pair, qty) in positions.iter().filter(|(_, q)| *q != 0) {
        info!(pair = %pair, position = qty, "position");
    }
    for p in &pnls {
        info!(
            account = %p.account,
            ticker = %p.ticker,
            realized = %p.realized,
            unrealized = %p.unrealized,
            total = %p.total,
            "pnl"
        );
    }
    Ok(())
}
