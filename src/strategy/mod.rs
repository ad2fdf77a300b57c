//! Strategy trait and reference strategies (spec.md §4.5).
//!
//! A strategy is a pure function of the context it's handed: it must not
//! retain `BookView`/`PortfolioView` borrows past the call, and two runs
//! fed the same event sequence must produce the same intents.

pub mod complement_arb;
pub mod replay_trades;

use rust_decimal::Decimal;

use crate::book::Book;
use crate::broker::{Order, TimeInForce};
use crate::ids::{AssetId, OrderId};
use crate::portfolio::Portfolio;
use crate::tape::schema::{Event, Side};

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub asset_id: AssetId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone)]
pub struct CancelIntent {
    pub order_id: OrderId,
}

/// Read-only view over one asset's book, handed to a strategy for the
/// lifetime of a single `on_event` call only.
pub struct BookView<'a> {
    pub asset_id: &'a AssetId,
    pub book: &'a Book,
}

/// Read-only view over the strategy's own resting orders and account
/// state, handed alongside [`BookView`].
pub struct StrategyContext<'a> {
    pub event: &'a Event,
    pub books: &'a std::collections::BTreeMap<AssetId, Book>,
    pub portfolio: &'a Portfolio,
    pub open_orders: Vec<&'a Order>,
    pub seq: u64,
}

impl<'a> StrategyContext<'a> {
    pub fn book(&self, asset_id: &AssetId) -> Option<BookView<'_>> {
        self.books.get(asset_id).map(|book| BookView { asset_id, book })
    }
}

/// A strategy reacts to one normalized event at a time and returns the
/// order/cancel intents it wants acted on. Implementations must be
/// deterministic: same inputs, same outputs, no hidden clock/RNG use
/// outside the context given to them.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    fn on_event(&mut self, ctx: &StrategyContext<'_>) -> (Vec<OrderIntent>, Vec<CancelIntent>);
}
