//! Position and portfolio accounting (spec.md §4.4).
//!
//! Each asset's position is tracked as a FIFO queue of lots opened in a
//! single direction; a fill on the opposite side closes the oldest lots
//! first and realizes gain/loss lot by lot, flipping direction cleanly if
//! it overruns the queue.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book::Book;
use crate::error::SimError;
use crate::ids::AssetId;
use crate::tape::schema::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMethod {
    /// Mark longs at best bid and shorts at best ask -- never credits an
    /// unrealized gain the book couldn't actually deliver on exit.
    BidForLong,
    Midpoint,
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioConfig {
    pub fee_rate: Decimal,
    /// `true`: fee charged per fill as `fee_rate * notional`.
    /// `false` (default): fee charged only on realized gross profit.
    pub fee_on_notional: bool,
    pub mark_method: MarkMethod,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(0, 0),
            fee_on_notional: false,
            mark_method: MarkMethod::BidForLong,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lot {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Signed: positive is long, negative is short.
    pub net_qty: Decimal,
    lots: VecDeque<Lot>,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub resolved: bool,
}

impl Position {
    fn push_lot(&mut self, price: Decimal, size: Decimal) {
        if size > Decimal::ZERO {
            self.lots.push_back(Lot { price, size });
        }
    }

    pub fn mark(&self, book: &Book, method: MarkMethod) -> Option<Decimal> {
        if self.net_qty.is_zero() {
            return Some(Decimal::ZERO);
        }
        let price = match method {
            MarkMethod::Midpoint => book.mid()?,
            MarkMethod::BidForLong => {
                if self.net_qty > Decimal::ZERO {
                    book.best_bid()?.0
                } else {
                    book.best_ask()?.0
                }
            }
        };
        let avg_cost = self.average_cost();
        Some((price - avg_cost) * self.net_qty)
    }

    pub fn average_cost(&self) -> Decimal {
        let total_size: Decimal = self.lots.iter().map(|l| l.size).sum();
        if total_size.is_zero() {
            return Decimal::ZERO;
        }
        let weighted: Decimal = self.lots.iter().map(|l| l.price * l.size).sum();
        weighted / total_size
    }
}

/// Point-in-time view of one asset's position, shaped for `ledger.jsonl`
/// (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub net_size: Decimal,
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
}

pub struct Portfolio {
    cfg: PortfolioConfig,
    pub cash: Decimal,
    positions: BTreeMap<AssetId, Position>,
}

impl Portfolio {
    pub fn new(cfg: PortfolioConfig, starting_cash: Decimal) -> Self {
        Self {
            cfg,
            cash: starting_cash,
            positions: BTreeMap::new(),
        }
    }

    pub fn position(&self, asset_id: &AssetId) -> Option<&Position> {
        self.positions.get(asset_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&AssetId, &Position)> {
        self.positions.iter()
    }

    /// Snapshot of every tracked position, for `ledger.jsonl` (spec.md §6).
    pub fn snapshot(&self) -> BTreeMap<AssetId, PositionSnapshot> {
        self.positions
            .iter()
            .map(|(asset_id, pos)| {
                (
                    asset_id.clone(),
                    PositionSnapshot {
                        net_size: pos.net_qty,
                        avg_cost: pos.average_cost(),
                        realized_pnl: pos.realized_pnl,
                        fees_paid: pos.fees_paid,
                    },
                )
            })
            .collect()
    }

    pub fn realized_pnl_total(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn fees_paid_total(&self) -> Decimal {
        self.positions.values().map(|p| p.fees_paid).sum()
    }

    pub fn equity(&self, books: &BTreeMap<AssetId, Book>) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .iter()
            .filter_map(|(asset_id, pos)| {
                if pos.resolved {
                    return None;
                }
                books.get(asset_id).and_then(|b| pos.mark(b, self.cfg.mark_method))
            })
            .sum();
        self.cash + unrealized
    }

    /// Applies one fill to the named asset's position (spec.md §4.4 FIFO
    /// lot accounting). Returns the fee charged against `cash` for this
    /// fill specifically, for `fills.jsonl`'s `fee_charged` field.
    pub fn apply_fill(&mut self, asset_id: &AssetId, side: Side, price: Decimal, size: Decimal) -> Result<Decimal, SimError> {
        let pos = self.positions.entry(asset_id.clone()).or_default();
        let delta = match side {
            Side::Buy => size,
            Side::Sell => -size,
        };

        let notional = price * size;
        match side {
            Side::Buy => self.cash -= notional,
            Side::Sell => self.cash += notional,
        }

        let mut fee = Decimal::ZERO;
        let same_direction = pos.net_qty.is_zero() || pos.net_qty.signum() == delta.signum();
        if same_direction {
            pos.push_lot(price, size);
            pos.net_qty += delta;
        } else {
            let mut remaining = size;
            let closing_long = pos.net_qty > Decimal::ZERO;
            let mut realized = Decimal::ZERO;
            while remaining > Decimal::ZERO {
                let Some(front) = pos.lots.front_mut() else { break };
                let closed = front.size.min(remaining);
                let pnl_per_unit = if closing_long { price - front.price } else { front.price - price };
                realized += pnl_per_unit * closed;
                front.size -= closed;
                remaining -= closed;
                if front.size.is_zero() {
                    pos.lots.pop_front();
                }
            }
            pos.realized_pnl += realized;
            if !self.cfg.fee_on_notional {
                fee = (realized * self.cfg.fee_rate).max(Decimal::ZERO);
            }
            pos.net_qty += delta;
            if remaining > Decimal::ZERO {
                // Overran the queue: the position flipped direction.
                pos.push_lot(price, remaining);
            }
        }

        if self.cfg.fee_on_notional {
            fee = notional * self.cfg.fee_rate;
        }
        if fee > Decimal::ZERO {
            pos.fees_paid += fee;
            self.cash -= fee;
        }

        if pos.net_qty.abs() > Decimal::new(1, 6) && pos.lots.is_empty() {
            return Err(SimError::PortfolioInvariantViolation(format!(
                "asset {asset_id} has non-zero net_qty {} with no backing lots",
                pos.net_qty
            )));
        }
        Ok(fee)
    }

    /// Settles a resolved market at its final value (1 for YES, 0 for NO,
    /// or any fractional pari-mutuel value), closing out all remaining
    /// lots against it (spec.md §4.4 resolution handling).
    pub fn resolve(&mut self, asset_id: &AssetId, final_value: Decimal) {
        let Some(pos) = self.positions.get_mut(asset_id) else { return };
        if pos.resolved || pos.net_qty.is_zero() {
            pos.resolved = true;
            return;
        }
        let settle_side = if pos.net_qty > Decimal::ZERO { Side::Sell } else { Side::Buy };
        let qty = pos.net_qty.abs();
        drop(pos);
        let _ = self.apply_fill(asset_id, settle_side, final_value, qty);
        if let Some(pos) = self.positions.get_mut(asset_id) {
            pos.resolved = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn buy_then_sell_realizes_fifo_pnl() {
        let mut pf = Portfolio::new(PortfolioConfig::default(), d("1000"));
        let asset: AssetId = "a".into();
        pf.apply_fill(&asset, Side::Buy, d("0.40"), d("100")).unwrap();
        pf.apply_fill(&asset, Side::Sell, d("0.50"), d("60")).unwrap();

        let pos = pf.position(&asset).unwrap();
        assert_eq!(pos.net_qty, d("40"));
        assert_eq!(pos.realized_pnl, d("6.00"));
    }

    #[test]
    fn overselling_flips_direction() {
        let mut pf = Portfolio::new(PortfolioConfig::default(), d("1000"));
        let asset: AssetId = "a".into();
        pf.apply_fill(&asset, Side::Buy, d("0.40"), d("10")).unwrap();
        pf.apply_fill(&asset, Side::Sell, d("0.50"), d("30")).unwrap();

        let pos = pf.position(&asset).unwrap();
        assert_eq!(pos.net_qty, d("-20"));
        assert_eq!(pos.realized_pnl, d("1.00"));
    }

    #[test]
    fn resolution_settles_remaining_position() {
        let mut pf = Portfolio::new(PortfolioConfig::default(), d("1000"));
        let asset: AssetId = "a".into();
        pf.apply_fill(&asset, Side::Buy, d("0.40"), d("100")).unwrap();
        pf.resolve(&asset, d("1.0"));

        let pos = pf.position(&asset).unwrap();
        assert!(pos.resolved);
        assert_eq!(pos.net_qty, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, d("60.00"));
    }
}
