// ===============================
// src/ledger.rs (FIFO lot accounting)
// ===============================
//
// Pure, store-free lot arithmetic for one (account, ticker):
// - buys append a lot at the tail
// - sells consume from the head; only the head lot is ever partially reduced
// - lots are never reordered
//
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::Lot;

/// Lot arithmetic that does not fit in a `Decimal` or an `i64`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("lot arithmetic overflowed")]
pub struct Overflow;

/// Result of matching one sell against the lot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SellOutcome {
    pub realized: Decimal,
    /// Shares matched against existing lots.
    pub matched: i64,
    /// Shares left over once every lot was consumed (oversell).
    pub unresolved: i64,
    /// Lots removed entirely.
    pub lots_closed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LotLedger {
    lots: Vec<Lot>,
}

fn lot_pnl(price: Decimal, cost: Decimal, quantity: i64) -> Result<Decimal, Overflow> {
    price
        .checked_sub(cost)
        .and_then(|d| d.checked_mul(Decimal::from(quantity)))
        .ok_or(Overflow)
}

impl LotLedger {
    pub fn new(lots: Vec<Lot>) -> Self {
        Self { lots }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self { lots: serde_json::from_str(json)? })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.lots)
    }

    pub fn lots(&self) -> &[Lot] {
        &self.lots
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    /// Sum of open lot quantities, `None` if it does not fit an `i64`.
    pub fn open_quantity(&self) -> Option<i64> {
        self.lots.iter().try_fold(0i64, |acc, l| acc.checked_add(l.quantity))
    }

    pub fn buy(&mut self, lot: Lot) {
        self.lots.push(lot);
    }

    /// Matches `quantity` shares sold at `price` against the oldest lots.
    /// On overflow the ledger is left untouched.
    pub fn sell(&mut self, price: Decimal, quantity: i64) -> Result<SellOutcome, Overflow> {
        let mut out = SellOutcome::default();
        let mut remaining = quantity;
        let mut closed = 0usize;
        // new quantity of the head lot once partially consumed
        let mut reduced_head: Option<i64> = None;

        for lot in &self.lots {
            if remaining <= 0 {
                break;
            }
            let take = lot.quantity.min(remaining);
            let pnl = lot_pnl(price, lot.price, take)?;
            out.realized = out.realized.checked_add(pnl).ok_or(Overflow)?;
            remaining -= take;
            if take == lot.quantity {
                closed += 1;
            } else {
                reduced_head = Some(lot.quantity - take);
            }
        }

        self.lots.drain(..closed);
        if let (Some(q), Some(head)) = (reduced_head, self.lots.first_mut()) {
            head.quantity = q;
        }
        out.matched = quantity - remaining;
        out.unresolved = remaining;
        out.lots_closed = closed;
        Ok(out)
    }

    /// Mark-to-market of the open lots at `live`.
    pub fn unrealized(&self, live: Decimal) -> Result<Decimal, Overflow> {
        self.lots.iter().try_fold(Decimal::ZERO, |acc, l| {
            acc.checked_add(lot_pnl(live, l.price, l.quantity)?).ok_or(Overflow)
        })
    }

    /// Quantity-weighted average cost of the open lots.
    pub fn average_cost(&self) -> Option<Decimal> {
        let qty = self.open_quantity()?;
        if qty == 0 {
            return None;
        }
        let cost = self.lots.iter().try_fold(Decimal::ZERO, |acc, l| {
            acc.checked_add(l.price.checked_mul(Decimal::from(l.quantity))?)
        })?;
        cost.checked_div(Decimal::from(qty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn lot(price: Decimal, quantity: i64) -> Lot {
        Lot { price, quantity, date: "2024-01-02".into(), time: "10:00:00".into() }
    }

    #[test]
    fn sell_spans_two_lots() {
        let mut l = LotLedger::default();
        l.buy(lot(dec!(100), 10));
        l.buy(lot(dec!(110), 10));
        let out = l.sell(dec!(105), 15).unwrap();
        // (105-100)*10 + (105-110)*5
        assert_eq!(out.realized, dec!(25));
        assert_eq!(out.matched, 15);
        assert_eq!(out.unresolved, 0);
        assert_eq!(out.lots_closed, 1);
        assert_eq!(l.lots(), &[lot(dec!(110), 5)]);
    }

    #[test]
    fn selling_exactly_the_rest_of_a_partial_lot_keeps_its_price() {
        let mut l = LotLedger::new(vec![lot(dec!(100), 10), lot(dec!(120), 10)]);
        l.sell(dec!(130), 4).unwrap();
        assert_eq!(l.lots()[0], lot(dec!(100), 6));
        let out = l.sell(dec!(90), 6).unwrap();
        assert_eq!(out.realized, dec!(-60));
        assert_eq!(l.lots(), &[lot(dec!(120), 10)]);
    }

    #[test]
    fn oversell_realizes_available_only() {
        let mut l = LotLedger::new(vec![lot(dec!(10), 3)]);
        let out = l.sell(dec!(12), 5).unwrap();
        assert_eq!(out.realized, dec!(6));
        assert_eq!(out.matched, 3);
        assert_eq!(out.unresolved, 2);
        assert!(l.is_empty());

        let out = LotLedger::default().sell(dec!(12), 5).unwrap();
        assert_eq!(out, SellOutcome { realized: Decimal::ZERO, matched: 0, unresolved: 5, lots_closed: 0 });
    }

    #[test]
    fn unrealized_and_average_cost() {
        let l = LotLedger::new(vec![lot(dec!(100), 5), lot(dec!(110), 10)]);
        assert_eq!(l.unrealized(dec!(115)), Ok(dec!(125)));
        let avg = l.average_cost().unwrap();
        assert!((avg - dec!(106.6667)).abs() < dec!(0.0001));
        assert_eq!(LotLedger::default().unrealized(dec!(1)), Ok(Decimal::ZERO));
        assert_eq!(LotLedger::default().average_cost(), None);
    }

    #[test]
    fn overflow_is_reported_and_leaves_lots_alone() {
        let huge = Decimal::MAX / dec!(2);
        let mut l = LotLedger::new(vec![lot(dec!(1), 5), lot(dec!(1), i64::MAX)]);
        let before = l.clone();
        assert_eq!(l.sell(huge, 8), Err(Overflow));
        assert_eq!(l, before);
        assert_eq!(l.unrealized(huge), Err(Overflow));
        assert_eq!(l.open_quantity(), None);
        assert_eq!(l.average_cost(), None);
    }

    #[test]
    fn json_is_oldest_first() {
        let l = LotLedger::new(vec![lot(dec!(1.5), 1), lot(dec!(2), 2)]);
        let back = LotLedger::from_json(&l.to_json().unwrap()).unwrap();
        assert_eq!(back, l);
        assert!(l.to_json().unwrap().starts_with("[{\"price\":\"1.5\""));
    }

    proptest! {
        // open lot quantity tracks the net position while it stays non-negative
        #[test]
        fn lot_sum_matches_position(trades in proptest::collection::vec((any::<bool>(), 1i64..50, 1u32..500), 1..60)) {
            let mut l = LotLedger::default();
            let mut position = 0i64;
            for (is_buy, qty, px) in trades {
                let price = Decimal::from(px);
                if is_buy {
                    l.buy(lot(price, qty));
                    position += qty;
                } else {
                    let q = qty.min(position);
                    if q == 0 { continue; }
                    let before: Vec<Lot> = l.lots().to_vec();
                    let out = l.sell(price, q).unwrap();
                    position -= q;
                    prop_assert_eq!(out.unresolved, 0);
                    // surviving lots are a suffix of the old list, head possibly reduced
                    let kept = l.lots();
                    prop_assert_eq!(before.len() - out.lots_closed, kept.len());
                    for (old, new) in before[out.lots_closed..].iter().zip(kept) {
                        prop_assert_eq!(old.price, new.price);
                    }
                }
                prop_assert_eq!(l.open_quantity(), Some(position));
            }
        }
    }
}
