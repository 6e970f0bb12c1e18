// ===============================
// src/domain.rs
// ===============================
//
// Wire formats and record shapes shared by every component:
// - TradeSubmission : "{account},{ticker}:{price}:{buy|sell}:{qty}:{action}"
// - TradeKey        : "{account},{ticker}:{YYYY-MM-DD}:{uuid}"
// - TradeRecord     : hash stored under a TradeKey, never mutated
// - Lot             : one unconsumed buy tranche, JSON encoded in lot lists
//
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---- Store key layout ----
pub const POSITIONS_HASH: &str = "positions";
pub const REALIZED_PNL_HASH: &str = "realized_pnl_by_position";
pub const UNREALIZED_PNL_HASH: &str = "unrealized_pnl_by_position";
pub const WATERMARK_KEY: &str = "pnl_listener:last_processed_ts";
pub const ACCOUNTS_SET: &str = "accounts";
pub const BOOKED_COUNTER: &str = "total_trades_booked";
pub const SUBMISSION_FIELD: &str = "trade_string";
pub const LOTS_PREFIX: &str = "lots:";
pub const SHARD_QUEUE_PREFIX: &str = "pnl_queue:";

/// Glob matching every trade record key (and nothing else we write).
pub const TRADE_KEY_PATTERN: &str = "*,*:*:*";

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M:%S";

// ---- Record field names ----
pub const F_ACCOUNT: &str = "account";
pub const F_DATE: &str = "trade_date";
pub const F_TIME: &str = "trade_time";
pub const F_TICKER: &str = "ticker";
pub const F_PRICE: &str = "price";
pub const F_TYPE: &str = "type";
pub const F_QUANTITY: &str = "quantity";
pub const F_ACTION: &str = "action_type";
/// Ingestion log id of the submission; orders same-second trades.
pub const F_SEQ: &str = "log_seq";

/// Largest accepted per-share price. Keeps every lot product well inside
/// `Decimal` range.
pub const MAX_PRICE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);
/// Largest accepted share count for one trade.
pub const MAX_QUANTITY: i64 = 1_000_000_000;

/// Fields a record snapshot must carry before it is treated as a trade.
pub const REQUIRED_FIELDS: [&str; 6] = [F_TIME, F_TICKER, F_PRICE, F_TYPE, F_QUANTITY, F_ACTION];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed shape: {0}")]
    Shape(String),
    #[error("invalid account name: {0:?}")]
    Account(String),
    #[error("invalid ticker: {0:?}")]
    Ticker(String),
    #[error("invalid price: {0:?}")]
    Price(String),
    #[error("invalid trade type: {0:?}")]
    Side(String),
    #[error("invalid quantity: {0:?}")]
    Quantity(String),
    #[error("invalid action type: {0:?}")]
    Action(String),
    #[error("invalid date: {0:?}")]
    Date(String),
    #[error("invalid time: {0:?}")]
    Time(String),
    #[error("incomplete record: missing field {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(ParseError::Side(s.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn valid_account(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_ticker(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn parse_account(s: &str) -> Result<String, ParseError> {
    let s = s.trim();
    if valid_account(s) {
        Ok(s.to_string())
    } else {
        Err(ParseError::Account(s.to_string()))
    }
}

fn parse_ticker(s: &str) -> Result<String, ParseError> {
    let s = s.trim();
    if valid_ticker(s) {
        Ok(s.to_string())
    } else {
        Err(ParseError::Ticker(s.to_string()))
    }
}

fn parse_price(s: &str) -> Result<Decimal, ParseError> {
    let raw = s.trim();
    let raw = raw.strip_prefix('$').unwrap_or(raw);
    match Decimal::from_str(raw) {
        Ok(px) if px > Decimal::ZERO && px <= MAX_PRICE => Ok(px.normalize()),
        _ => Err(ParseError::Price(s.to_string())),
    }
}

fn parse_quantity(s: &str) -> Result<i64, ParseError> {
    match s.trim().parse::<i64>() {
        Ok(q) if q > 0 && q <= MAX_QUANTITY => Ok(q),
        _ => Err(ParseError::Quantity(s.to_string())),
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|_| ParseError::Date(s.to_string()))
}

pub fn parse_time(s: &str) -> Result<NaiveTime, ParseError> {
    NaiveTime::parse_from_str(s, TIME_FMT).map_err(|_| ParseError::Time(s.to_string()))
}

/// Seconds since the epoch for a booked (date, time) pair.
pub fn trade_timestamp(date: NaiveDate, time: NaiveTime) -> i64 {
    NaiveDateTime::new(date, time).and_utc().timestamp()
}

/// (account, ticker): the unit of position, lot and PnL state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub account: String,
    pub ticker: String,
}

impl PairKey {
    pub fn new(account: impl Into<String>, ticker: impl Into<String>) -> Self {
        Self { account: account.into(), ticker: ticker.into() }
    }

    /// Parses the `"{account},{ticker}"` prefix of a trade key.
    pub fn parse_combo(combo: &str) -> Result<Self, ParseError> {
        let (account, ticker) = combo
            .split_once(',')
            .ok_or_else(|| ParseError::Shape(combo.to_string()))?;
        Ok(Self { account: parse_account(account)?, ticker: parse_ticker(ticker)? })
    }

    /// Field in the positions hash: `"{account}:{ticker}"`.
    pub fn position_field(&self) -> String {
        format!("{}:{}", self.account, self.ticker)
    }

    /// Field in the realized/unrealized PnL hashes: `"{account}/{ticker}"`.
    pub fn pnl_field(&self) -> String {
        format!("{}/{}", self.account, self.ticker)
    }

    pub fn lots_key(&self) -> String {
        format!("{}{}/{}", LOTS_PREFIX, self.account, self.ticker)
    }

    /// Scan pattern for every trade record of exactly this pair.
    pub fn records_pattern(&self) -> String {
        format!("{},{}:*", self.account, self.ticker)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.account, self.ticker)
    }
}

/// Raw submission as queued on the ingestion log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSubmission {
    pub account: String,
    pub ticker: String,
    pub price: Decimal,
    pub side: Side,
    pub quantity: i64,
    pub action: String,
}

impl TradeSubmission {
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.account.clone(), self.ticker.clone())
    }
}

impl FromStr for TradeSubmission {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "{account},{ticker}" then four ':'-separated fields
        let (combo, rest) = s
            .split_once(':')
            .ok_or_else(|| ParseError::Shape(s.to_string()))?;
        let parts: Vec<&str> = rest.split(':').collect();
        let [price, side, qty, action] = parts.as_slice() else {
            return Err(ParseError::Shape(s.to_string()));
        };
        let pair = PairKey::parse_combo(combo)?;
        let action = action.trim().to_ascii_lowercase();
        if action.is_empty() || !action.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ParseError::Action(action));
        }
        Ok(Self {
            account: pair.account,
            ticker: pair.ticker,
            price: parse_price(price)?,
            side: side.parse()?,
            quantity: parse_quantity(qty)?,
            action,
        })
    }
}

impl fmt::Display for TradeSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}:{}:{}:{}:{}",
            self.account, self.ticker, self.price, self.side, self.quantity, self.action
        )
    }
}

/// Key of one booked trade: `"{account},{ticker}:{YYYY-MM-DD}:{uuid}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub pair: PairKey,
    pub date: NaiveDate,
    pub id: String,
}

impl TradeKey {
    pub fn account(&self) -> &str {
        &self.pair.account
    }
}

impl FromStr for TradeKey {
    type Err = ParseError;

    /// Exactly three ':'-delimited segments, the middle one a calendar date.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [combo, date, id] = parts.as_slice() else {
            return Err(ParseError::Shape(s.to_string()));
        };
        let date = parse_date(date)?;
        if id.is_empty() {
            return Err(ParseError::Shape(s.to_string()));
        }
        Ok(Self { pair: PairKey::parse_combo(combo)?, date, id: id.to_string() })
    }
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.pair, self.date.format(DATE_FMT), self.id)
    }
}

/// Immutable booked trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub key: TradeKey,
    pub time: NaiveTime,
    pub price: Decimal,
    pub side: Side,
    pub quantity: i64,
    pub action: String,
    /// Position in the ingestion log, 0 when unknown.
    pub seq: u64,
}

impl TradeRecord {
    pub fn from_submission(sub: &TradeSubmission, date: NaiveDate, time: NaiveTime, id: String) -> Self {
        Self {
            key: TradeKey { pair: sub.pair(), date, id },
            time,
            price: sub.price,
            side: sub.side,
            quantity: sub.quantity,
            action: sub.action.clone(),
            seq: 0,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn pair(&self) -> &PairKey {
        &self.key.pair
    }

    pub fn timestamp(&self) -> i64 {
        trade_timestamp(self.key.date, self.time)
    }

    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity
    }

    /// Hash fields as written by the booker.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (F_ACCOUNT.into(), self.key.pair.account.clone()),
            (F_DATE.into(), self.key.date.format(DATE_FMT).to_string()),
            (F_TIME.into(), self.time.format(TIME_FMT).to_string()),
            (F_TICKER.into(), self.key.pair.ticker.clone()),
            (F_PRICE.into(), self.price.to_string()),
            (F_TYPE.into(), self.side.as_str().into()),
            (F_QUANTITY.into(), self.quantity.to_string()),
            (F_ACTION.into(), self.action.clone()),
            (F_SEQ.into(), self.seq.to_string()),
        ]
    }

    /// Rebuilds a record from a stored hash snapshot. Snapshots missing any
    /// required field are rejected so a half-written hash is never read as a trade.
    pub fn from_fields(key: TradeKey, fields: &HashMap<String, String>) -> Result<Self, ParseError> {
        for f in REQUIRED_FIELDS {
            if !fields.contains_key(f) {
                return Err(ParseError::MissingField(f));
            }
        }
        let get = |f: &'static str| fields.get(f).map(String::as_str).unwrap_or_default();
        if get(F_TICKER).trim() != key.pair.ticker {
            return Err(ParseError::Ticker(get(F_TICKER).to_string()));
        }
        Ok(Self {
            time: parse_time(get(F_TIME))?,
            price: parse_price(get(F_PRICE))?,
            side: get(F_TYPE).parse()?,
            quantity: parse_quantity(get(F_QUANTITY))?,
            action: get(F_ACTION).to_string(),
            seq: get(F_SEQ).parse().unwrap_or(0),
            key,
        })
    }
}

/// One unconsumed buy tranche.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub quantity: i64,
    pub date: String,
    pub time: String,
}

impl Lot {
    pub fn from_record(rec: &TradeRecord) -> Self {
        Self {
            price: rec.price,
            quantity: rec.quantity,
            date: rec.key.date.format(DATE_FMT).to_string(),
            time: rec.time.format(TIME_FMT).to_string(),
        }
    }
}

pub fn shard_queue_key(shard: char) -> String {
    format!("{}{}", SHARD_QUEUE_PREFIX, shard)
}
