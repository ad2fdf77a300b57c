//! L2 order book state machine (spec.md §4.2).
//!
//! One [`Book`] per asset. Levels are kept as plain `price -> size` maps;
//! size zero removes a level rather than leaving a zero entry behind.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::error::SimError;
use crate::ids::AssetId;
use crate::tape::schema::{Payload, PriceLevel, Side};
use crate::utils::is_tick_aligned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStatus {
    /// No snapshot applied yet; queries return `None`.
    Uninitialized,
    Normal,
    /// best_bid >= best_ask. Orders are not re-evaluated against a locked
    /// or crossed book until it clears (spec.md §4.2 edge cases).
    Locked,
    Crossed,
}

#[derive(Debug, Clone)]
pub struct Book {
    asset_id: AssetId,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    tick_size: Decimal,
    status: BookStatus,
    last_seq: Option<u64>,
    pub invalid_entries: u64,
}

impl Book {
    pub fn new(asset_id: AssetId, tick_size: Decimal) -> Self {
        Self {
            asset_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            tick_size,
            status: BookStatus::Uninitialized,
            last_seq: None,
            invalid_entries: 0,
        }
    }

    pub fn asset_id(&self) -> &AssetId {
        &self.asset_id
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.status, BookStatus::Uninitialized)
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, s)| (*p, *s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, s)| (*p, *s))
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn depth_at(&self, side: Side, price: Decimal) -> Decimal {
        let book = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        book.get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    /// Total resting size strictly ahead of `price` on `side` (better or
    /// equal priority), used by the broker's queue-position model.
    pub fn depth_ahead_of(&self, side: Side, price: Decimal) -> Decimal {
        match side {
            Side::Buy => self.bids.range(price..).map(|(_, s)| *s).sum(),
            Side::Sell => self.asks.range(..=price).map(|(_, s)| *s).sum(),
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    fn recompute_status(&mut self) {
        self.status = match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) if bid > ask => BookStatus::Crossed,
            (Some((bid, _)), Some((ask, _))) if bid == ask => BookStatus::Locked,
            _ => BookStatus::Normal,
        };
    }

    fn apply_level(book: &mut BTreeMap<Decimal, Decimal>, price: Decimal, size: Decimal) {
        if size.is_zero() {
            book.remove(&price);
        } else {
            book.insert(price, size);
        }
    }

    /// Applies one normalized event to this book (spec.md §4.2 update
    /// rules). Returns `Err` for malformed input the book cannot absorb;
    /// invalid individual levels within an otherwise-valid event are
    /// dropped and counted rather than failing the whole event.
    pub fn apply(&mut self, seq: u64, payload: &Payload) -> Result<(), SimError> {
        match payload {
            Payload::BookSnapshot { asks, bids, tick_size, .. } => {
                self.bids.clear();
                self.asks.clear();
                self.tick_size = *tick_size;
                for PriceLevel { price, size } in bids {
                    self.apply_level_checked(Side::Buy, *price, *size, seq);
                }
                for PriceLevel { price, size } in asks {
                    self.apply_level_checked(Side::Sell, *price, *size, seq);
                }
                self.status = BookStatus::Normal;
                self.recompute_status();
            }
            Payload::PriceChange(entries) => {
                if !self.is_initialized() {
                    return Err(SimError::BookInconsistency {
                        asset_id: self.asset_id.clone(),
                        seq,
                        reason: "price_change before first snapshot".to_string(),
                    });
                }
                for entry in entries {
                    self.apply_level_checked(entry.side, entry.price, entry.size, seq);
                }
                self.recompute_status();
            }
            Payload::TickSizeChange { tick_size } => {
                self.tick_size = *tick_size;
                self.purge_misaligned_levels(seq);
            }
            Payload::LastTradePrice { .. } | Payload::Control { .. } => {
                // Does not mutate book state.
            }
        }
        self.last_seq = Some(seq);
        Ok(())
    }

    fn apply_level_checked(&mut self, side: Side, price: Decimal, size: Decimal, seq: u64) {
        if price <= Decimal::ZERO || price >= Decimal::ONE || !is_tick_aligned(price, self.tick_size) {
            self.invalid_entries += 1;
            log::warn!(
                "book.invalid_level asset={} seq={} side={:?} price={} size={}",
                self.asset_id, seq, side, price, size
            );
            return;
        }
        let book = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        Self::apply_level(book, price, size);
    }

    /// Drops any resting level no longer aligned to the current `tick_size`
    /// after a `tick_size_change` event, counting each as a `run_quality`
    /// warning rather than leaving stale misaligned levels in the book
    /// (spec.md §4.2).
    fn purge_misaligned_levels(&mut self, seq: u64) {
        let tick_size = self.tick_size;
        let mut dropped = 0u64;
        self.bids.retain(|price, _| {
            let keep = is_tick_aligned(*price, tick_size);
            if !keep {
                dropped += 1;
            }
            keep
        });
        self.asks.retain(|price, _| {
            let keep = is_tick_aligned(*price, tick_size);
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            self.invalid_entries += dropped;
            log::warn!(
                "book.tick_size_change_purge asset={} seq={} tick_size={} dropped={}",
                self.asset_id, seq, tick_size, dropped
            );
            self.recompute_status();
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

    fn snapshot(bids: Vec<(&str, &str)>, asks: Vec<(&str, &str)>) -> Payload {
        Payload::BookSnapshot {
            bids: bids.into_iter().map(|(p, s)| PriceLevel { price: d(p), size: d(s) }).collect(),
            asks: asks.into_iter().map(|(p, s)| PriceLevel { price: d(p), size: d(s) }).collect(),
            tick_size: d("0.01"),
            hash: "h".into(),
        }
    }

    #[test]
    fn uninitialized_until_snapshot() {
        let book = Book::new("a".into(), d("0.01"));
        assert!(!book.is_initialized());
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn snapshot_then_best_levels() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("0.48", "50")], vec![("0.50", "100")])).unwrap();
        assert!(book.is_initialized());
        assert_eq!(book.best_bid(), Some((d("0.48"), d("50"))));
        assert_eq!(book.best_ask(), Some((d("0.50"), d("100"))));
        assert_eq!(book.status(), BookStatus::Normal);
    }

    #[test]
    fn price_change_removes_zero_size_level() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("0.48", "50")], vec![("0.50", "100")])).unwrap();
        book.apply(
            1,
            &Payload::PriceChange(vec![crate::tape::schema::PriceChangeEntry {
                side: Side::Buy,
                price: d("0.48"),
                size: Decimal::ZERO,
            }]),
        )
        .unwrap();
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn crossed_book_detected() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("0.51", "50")], vec![("0.50", "100")])).unwrap();
        assert_eq!(book.status(), BookStatus::Crossed);
    }

    #[test]
    fn price_change_before_snapshot_rejected() {
        let mut book = Book::new("a".into(), d("0.01"));
        let err = book.apply(
            0,
            &Payload::PriceChange(vec![crate::tape::schema::PriceChangeEntry {
                side: Side::Buy,
                price: d("0.48"),
                size: d("1"),
            }]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn invalid_price_level_is_dropped_and_counted() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("1.50", "50")], vec![("0.50", "100")])).unwrap();
        assert_eq!(book.invalid_entries, 1);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn tick_size_change_purges_misaligned_levels() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("0.48", "50")], vec![("0.50", "100")])).unwrap();
        book.apply(1, &Payload::TickSizeChange { tick_size: d("0.05") }).unwrap();
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.invalid_entries, 2);
    }

    #[test]
    fn tick_size_change_keeps_still_aligned_levels() {
        let mut book = Book::new("a".into(), d("0.01"));
        book.apply(0, &snapshot(vec![("0.45", "50")], vec![("0.50", "100")])).unwrap();
        book.apply(1, &Payload::TickSizeChange { tick_size: d("0.05") }).unwrap();
        assert_eq!(book.best_bid(), Some((d("0.45"), d("50"))));
        assert_eq!(book.best_ask(), Some((d("0.50"), d("100"))));
        assert_eq!(book.invalid_entries, 0);
    }
}
