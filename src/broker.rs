//! Broker fill simulator (spec.md §4.3).
//!
//! The model is deliberately conservative: an order is never credited a
//! fill just because its price crosses the displayed touch. It only fills
//! once the book itself gives evidence that size actually traded away --
//! either a price level it queues behind is fully wiped (the "full-level-
//! taken" condition, spec.md §8 scenarios 1 and 4), or, in `relaxed` mode,
//! a trade print at its price consumes the size resting ahead of it.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::book::Book;
use crate::error::SimError;
use crate::ids::{AssetId, FillId, OrderId};
use crate::tape::schema::Side;
use crate::utils::is_tick_aligned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Active,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Active => "active",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    /// `true` for any non-terminal state (spec.md §3: `active` or
    /// `partially_filled`), i.e. still eligible for fills and cancellation.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Active | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: OrderId,
    pub asset_id: AssetId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub tif: TimeInForce,
    pub status: OrderStatus,
    pub created_seq: u64,
    pub cancel_requested_seq: Option<u64>,
    /// Which side of the book this order queues behind: its own side when
    /// joining an existing level there, the opposite side when its price
    /// crosses into existing liquidity (spec.md §8 scenarios 1, 4).
    watch_side: Side,
    /// Last observed resting size at `price` on `watch_side`.
    pub queue_ahead: Decimal,
    /// Whether `watch_side`'s level at `price` has ever been seen non-zero;
    /// a zero level before that is "no evidence yet", not "fully taken".
    ever_had_depth: bool,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub seq: u64,
}

/// One order lifecycle event, shaped for `orders.jsonl`'s `state_transition`
/// (spec.md §6). `from`/`to` use the spec's own vocabulary (`pending`,
/// `active`, `partially_filled`, `filled`, `cancelled`, `rejected`).
#[derive(Debug, Clone)]
pub struct Transition {
    pub order_id: OrderId,
    pub asset_id: AssetId,
    pub from: &'static str,
    pub to: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub min_order_notional: Decimal,
    /// How many sequence numbers a cancel takes to land; the order remains
    /// eligible to fill until then (spec.md §4.3 cancel_latency_seq).
    pub cancel_latency_seq: u64,
    /// `strict` (default): fills only from evidenced book depletion.
    /// `relaxed`: trade prints may additionally infer queue consumption.
    pub strict_realism: bool,
    /// Maximum age, in events, a non-terminal order may rest before it is
    /// cancelled outright (spec.md §3 Order entity, §4.3 state machine).
    pub tif_seq_limit: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            min_order_notional: Decimal::new(1, 0),
            cancel_latency_seq: 0,
            strict_realism: true,
            tif_seq_limit: None,
        }
    }
}

pub struct Broker {
    cfg: BrokerConfig,
    orders: HashMap<OrderId, Order>,
    next_fill_seq: u64,
}

impl Broker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            orders: HashMap::new(),
            next_fill_seq: 0,
        }
    }

    pub fn order(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.status.is_open())
    }

    /// Validates and admits a new order as active. Never fills on
    /// submission: even a price that crosses the touch only waits for
    /// depletion evidence like everything else (spec.md §8 scenario 1).
    /// IOC is validated for marketability at admission time only; an
    /// admitted IOC order then behaves exactly like GTC until it fills,
    /// is explicitly cancelled, or is swept at run end.
    pub fn submit(
        &mut self,
        order_id: OrderId,
        asset_id: AssetId,
        intent: OrderIntent,
        book: &Book,
        seq: u64,
    ) -> Result<Transition, SimError> {
        if intent.price <= Decimal::ZERO || intent.price >= Decimal::ONE {
            return Err(SimError::OrderValidationError {
                order_id,
                reason: "price_out_of_bounds".to_string(),
            });
        }
        if !is_tick_aligned(intent.price, book.tick_size()) {
            return Err(SimError::OrderValidationError {
                order_id,
                reason: "tick_misaligned".to_string(),
            });
        }
        if intent.size * intent.price < self.cfg.min_order_notional {
            return Err(SimError::OrderValidationError {
                order_id,
                reason: "below_min_notional".to_string(),
            });
        }
        if intent.tif == TimeInForce::Ioc && self.marketable_against(book, intent.side, intent.price).is_zero() {
            return Err(SimError::OrderValidationError {
                order_id,
                reason: "ioc_not_marketable".to_string(),
            });
        }

        let watch_side = if book.depth_at(intent.side.opposite(), intent.price) > Decimal::ZERO {
            intent.side.opposite()
        } else {
            intent.side
        };
        let queue_ahead = book.depth_at(watch_side, intent.price);
        let order = Order {
            order_id: order_id.clone(),
            asset_id: asset_id.clone(),
            side: intent.side,
            price: intent.price,
            size: intent.size,
            filled_size: Decimal::ZERO,
            tif: intent.tif,
            status: OrderStatus::Active,
            created_seq: seq,
            cancel_requested_seq: None,
            watch_side,
            queue_ahead,
            ever_had_depth: queue_ahead > Decimal::ZERO,
        };
        self.orders.insert(order_id.clone(), order);

        Ok(Transition { order_id, asset_id, from: "pending", to: "active", reason: "admitted".to_string() })
    }

    /// Size of resting opposite-side liquidity that `side`/`price` would
    /// cross through -- used only to gate IOC admission, never to fill.
    fn marketable_against(&self, book: &Book, side: Side, price: Decimal) -> Decimal {
        match side {
            Side::Buy => book
                .best_ask()
                .filter(|(ask, _)| *ask <= price)
                .map(|_| book.depth_ahead_of(Side::Sell, price))
                .unwrap_or(Decimal::ZERO),
            Side::Sell => book
                .best_bid()
                .filter(|(bid, _)| *bid >= price)
                .map(|_| book.depth_ahead_of(Side::Buy, price))
                .unwrap_or(Decimal::ZERO),
        }
    }

    pub fn request_cancel(&mut self, order_id: &OrderId, seq: u64) -> Result<(), SimError> {
        let order = self.orders.get_mut(order_id).ok_or_else(|| SimError::OrderValidationError {
            order_id: order_id.clone(),
            reason: "unknown_order".to_string(),
        })?;
        if !order.status.is_open() {
            return Err(SimError::OrderValidationError {
                order_id: order_id.clone(),
                reason: "not_active".to_string(),
            });
        }
        order.cancel_requested_seq = Some(seq);
        Ok(())
    }

    /// Primary conservative fill path (spec.md §8 scenarios 1, 4): for
    /// every active order of `asset_id`, re-reads the size at its
    /// `watch_side`/`price` level and fills it in full once that level has
    /// been seen non-zero and then hits exactly zero (the "full-level-
    /// taken" condition).
    pub fn on_book_update(&mut self, asset_id: &AssetId, book: &Book, seq: u64) -> (Vec<Fill>, Vec<Transition>) {
        let mut fills = Vec::new();
        let mut transitions = Vec::new();

        let mut order_ids: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.status.is_open() && &o.asset_id == asset_id)
            .map(|o| o.order_id.clone())
            .collect();
        order_ids.sort();

        for order_id in order_ids {
            let outcome = {
                let order = self.orders.get_mut(&order_id).expect("candidate exists");
                let current_depth = book.depth_at(order.watch_side, order.price);
                order.queue_ahead = current_depth;
                if current_depth > Decimal::ZERO {
                    order.ever_had_depth = true;
                }
                if order.ever_had_depth && current_depth.is_zero() && order.remaining() > Decimal::ZERO {
                    let from_status = order.status.as_str();
                    let fill_size = order.remaining();
                    order.filled_size += fill_size;
                    order.status = OrderStatus::Filled;
                    Some((order.side, order.price, fill_size, from_status))
                } else {
                    None
                }
            };
            if let Some((side, price, size, from_status)) = outcome {
                let fill_id = self.next_fill_id(&order_id);
                fills.push(Fill { fill_id, order_id: order_id.clone(), side, price, size, seq });
                transitions.push(Transition {
                    order_id,
                    asset_id: asset_id.clone(),
                    from: from_status,
                    to: "filled",
                    reason: "level_fully_taken".to_string(),
                });
            }
        }
        (fills, transitions)
    }

    /// Supplementary `relaxed`-mode fill path: infers queue consumption
    /// from trade prints rather than waiting for book depletion evidence.
    /// `trade_side` is the *aggressor* side of the print. A print that only
    /// partly covers an order's remaining size moves it to
    /// `partially_filled` rather than `filled` (spec.md §4.3).
    pub fn on_trade_print(&mut self, price: Decimal, size: Decimal, trade_side: Side, seq: u64) -> (Vec<Fill>, Vec<Transition>) {
        let mut fills = Vec::new();
        let mut transitions = Vec::new();
        if self.cfg.strict_realism {
            return (fills, transitions);
        }

        let mut remaining_print = size;
        let resting_side = trade_side.opposite();

        let mut candidates: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.status.is_open() && o.side == resting_side && o.price == price)
            .map(|o| o.order_id.clone())
            .collect();
        candidates.sort();

        for order_id in candidates {
            if remaining_print <= Decimal::ZERO {
                break;
            }
            let filled = {
                let order = self.orders.get_mut(&order_id).expect("candidate exists");
                if order.queue_ahead > Decimal::ZERO {
                    let consumed = order.queue_ahead.min(remaining_print);
                    order.queue_ahead -= consumed;
                    remaining_print -= consumed;
                }
                if remaining_print <= Decimal::ZERO {
                    None
                } else {
                    let fill_size = order.remaining().min(remaining_print);
                    if fill_size > Decimal::ZERO {
                        let from_status = order.status.as_str();
                        order.filled_size += fill_size;
                        remaining_print -= fill_size;
                        order.status = if order.remaining() <= Decimal::ZERO {
                            OrderStatus::Filled
                        } else {
                            OrderStatus::PartiallyFilled
                        };
                        Some((order.side, order.price, fill_size, from_status, order.status))
                    } else {
                        None
                    }
                }
            };
            if let Some((side, price, fill_size, from_status, status)) = filled {
                let fill_id = self.next_fill_id(&order_id);
                let asset_id = self.orders.get(&order_id).expect("candidate exists").asset_id.clone();
                fills.push(Fill { fill_id, order_id: order_id.clone(), side, price, size: fill_size, seq });
                let (to, reason) = match status {
                    OrderStatus::Filled => ("filled", "trade_print_consumed"),
                    OrderStatus::PartiallyFilled => ("partially_filled", "trade_print_partial_fill"),
                    _ => unreachable!("fill path only ever sets Filled or PartiallyFilled"),
                };
                transitions.push(Transition { order_id, asset_id, from: from_status, to, reason: reason.to_string() });
            }
        }
        (fills, transitions)
    }

    /// Applies any pending cancels whose latency has elapsed.
    pub fn expire_cancels(&mut self, seq: u64) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for order in self.orders.values_mut() {
            if let Some(requested) = order.cancel_requested_seq {
                if order.status.is_open() && seq >= requested + self.cfg.cancel_latency_seq {
                    let from_status = order.status.as_str();
                    order.status = OrderStatus::Canceled;
                    transitions.push(Transition {
                        order_id: order.order_id.clone(),
                        asset_id: order.asset_id.clone(),
                        from: from_status,
                        to: "cancelled",
                        reason: "cancel_latency_elapsed".to_string(),
                    });
                }
            }
        }
        transitions
    }

    /// Cancels every non-terminal order whose age since admission has
    /// reached `tif_seq_limit` (spec.md §3 Order entity, §4.3: "Any
    /// non-terminal → cancelled on ... tif_seq_limit reached").
    pub fn expire_tif(&mut self, seq: u64) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let Some(limit) = self.cfg.tif_seq_limit else { return transitions };
        for order in self.orders.values_mut() {
            if order.status.is_open() && seq.saturating_sub(order.created_seq) >= limit {
                let from_status = order.status.as_str();
                order.status = OrderStatus::Canceled;
                transitions.push(Transition {
                    order_id: order.order_id.clone(),
                    asset_id: order.asset_id.clone(),
                    from: from_status,
                    to: "cancelled",
                    reason: "tif_seq_limit".to_string(),
                });
            }
        }
        transitions
    }

    /// Cancels every resting order created strictly before `gap_seq`
    /// (spec.md §8 "Gap handling" testable property).
    pub fn cancel_on_gap(&mut self, gap_seq: u64) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for order in self.orders.values_mut() {
            if order.status.is_open() && order.created_seq < gap_seq {
                let from_status = order.status.as_str();
                order.status = OrderStatus::Canceled;
                transitions.push(Transition {
                    order_id: order.order_id.clone(),
                    asset_id: order.asset_id.clone(),
                    from: from_status,
                    to: "cancelled",
                    reason: "cancel_on_gap".to_string(),
                });
            }
        }
        transitions
    }

    /// Cancels every still-open order, used at run finalization
    /// (spec.md §8 scenario 1: "NO order cancelled on exit_reason=end_of_tape").
    pub fn cancel_all_resting(&mut self, reason: &str) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for order in self.orders.values_mut() {
            if order.status.is_open() {
                let from_status = order.status.as_str();
                order.status = OrderStatus::Canceled;
                transitions.push(Transition {
                    order_id: order.order_id.clone(),
                    asset_id: order.asset_id.clone(),
                    from: from_status,
                    to: "cancelled",
                    reason: reason.to_string(),
                });
            }
        }
        transitions
    }

    fn next_fill_id(&mut self, order_id: &OrderId) -> FillId {
        let fill_id = FillId(format!("{}-{}", order_id, self.next_fill_seq));
        self.next_fill_seq += 1;
        fill_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::schema::{Payload, PriceLevel};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn book_with(bids: Vec<(&str, &str)>, asks: Vec<(&str, &str)>) -> Book {
        let mut book = Book::new(AssetId::from("a"), d("0.01"));
        book.apply(
            0,
            &Payload::BookSnapshot {
                bids: bids.into_iter().map(|(p, s)| PriceLevel { price: d(p), size: d(s) }).collect(),
                asks: asks.into_iter().map(|(p, s)| PriceLevel { price: d(p), size: d(s) }).collect(),
                tick_size: d("0.01"),
                hash: "h".into(),
            },
        )
        .unwrap();
        book
    }

    fn asset() -> AssetId {
        AssetId::from("a")
    }

    #[test]
    fn resting_order_queues_behind_existing_depth() {
        let book = book_with(vec![("0.48", "50")], vec![("0.50", "100")]);
        let mut broker = Broker::new(BrokerConfig::default());
        broker
            .submit(
                OrderId("o1".into()),
                asset(),
                OrderIntent { side: Side::Buy, price: d("0.48"), size: d("10"), tif: TimeInForce::Gtc },
                &book,
                1,
            )
            .unwrap();
        let order = broker.order(&OrderId("o1".into())).unwrap();
        assert_eq!(order.queue_ahead, d("50"));
        assert_eq!(order.status, OrderStatus::Active);
    }

    #[test]
    fn book_depletion_fills_order_when_level_fully_taken() {
        let mut book = book_with(vec![], vec![("0.50", "100")]);
        let mut broker = Broker::new(BrokerConfig::default());
        broker
            .submit(
                OrderId("o1".into()),
                asset(),
                OrderIntent { side: Side::Buy, price: d("0.50"), size: d("10"), tif: TimeInForce::Gtc },
                &book,
                1,
            )
            .unwrap();

        book.apply(
            2,
            &Payload::PriceChange(vec![crate::tape::schema::PriceChangeEntry {
                side: Side::Sell,
                price: d("0.50"),
                size: d("60"),
            }]),
        )
        .unwrap();
        let (fills, _) = broker.on_book_update(&asset(), &book, 2);
        assert!(fills.is_empty());
        assert_eq!(broker.order(&OrderId("o1".into())).unwrap().queue_ahead, d("60"));

        book.apply(
            3,
            &Payload::PriceChange(vec![crate::tape::schema::PriceChangeEntry {
                side: Side::Sell,
                price: d("0.50"),
                size: Decimal::ZERO,
            }]),
        )
        .unwrap();
        let (fills, transitions) = broker.on_book_update(&asset(), &book, 3);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].size, d("10"));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, "filled");
        assert_eq!(broker.order(&OrderId("o1".into())).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn ioc_waits_for_depletion_even_when_marketable() {
        let book = book_with(vec![("0.48", "50")], vec![("0.50", "100")]);
        let mut broker = Broker::new(BrokerConfig::default());
        let transition = broker
            .submit(
                OrderId("o2".into()),
                asset(),
                OrderIntent { side: Side::Buy, price: d("0.50"), size: d("10"), tif: TimeInForce::Ioc },
                &book,
                1,
            )
            .unwrap();
        assert_eq!(transition.to, "active");
        assert_eq!(broker.order(&OrderId("o2".into())).unwrap().status, OrderStatus::Active);
    }

    #[test]
    fn ioc_not_marketable_is_rejected() {
        let book = book_with(vec![("0.58", "100")], vec![("0.60", "100")]);
        let mut broker = Broker::new(BrokerConfig::default());
        let err = broker.submit(
            OrderId("o3".into()),
            asset(),
            OrderIntent { side: Side::Buy, price: d("0.55"), size: d("10"), tif: TimeInForce::Ioc },
            &book,
            1,
        );
        match err {
            Err(SimError::OrderValidationError { reason, .. }) => assert_eq!(reason, "ioc_not_marketable"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_off_tick_price() {
        let book = book_with(vec![("0.48", "50")], vec![("0.50", "100")]);
        let mut broker = Broker::new(BrokerConfig::default());
        let err = broker.submit(
            OrderId("o4".into()),
            asset(),
            OrderIntent { side: Side::Buy, price: d("0.485"), size: d("10"), tif: TimeInForce::Gtc },
            &book,
            1,
        );
        match err {
            Err(SimError::OrderValidationError { reason, .. }) => assert_eq!(reason, "tick_misaligned"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn cancel_all_resting_sweeps_open_orders_at_run_end() {
        let book = book_with(vec![("0.48", "50")], vec![]);
        let mut broker = Broker::new(BrokerConfig::default());
        broker
            .submit(
                OrderId("o5".into()),
                asset(),
                OrderIntent { side: Side::Sell, price: d("0.40"), size: d("10"), tif: TimeInForce::Ioc },
                &book,
                1,
            )
            .unwrap();
        let transitions = broker.cancel_all_resting("end_of_tape");
        assert_eq!(transitions.len(), 1);
        assert_eq!(broker.order(&OrderId("o5".into())).unwrap().status, OrderStatus::Canceled);
    }

    #[test]
    fn trade_print_partial_fill_transitions_to_partially_filled() {
        let book = book_with(vec![], vec![("0.50", "10")]);
        let mut broker = Broker::new(BrokerConfig { strict_realism: false, ..BrokerConfig::default() });
        broker
            .submit(
                OrderId("o6".into()),
                asset(),
                OrderIntent { side: Side::Buy, price: d("0.50"), size: d("10"), tif: TimeInForce::Gtc },
                &book,
                1,
            )
            .unwrap();

        let (fills, transitions) = broker.on_trade_print(d("0.50"), d("4"), Side::Sell, 2);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].size, d("4"));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, "active");
        assert_eq!(transitions[0].to, "partially_filled");
        let order = broker.order(&OrderId("o6".into())).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining(), d("6"));

        let (fills2, transitions2) = broker.on_trade_print(d("0.50"), d("6"), Side::Sell, 3);
        assert_eq!(fills2.len(), 1);
        assert_eq!(transitions2[0].from, "partially_filled");
        assert_eq!(transitions2[0].to, "filled");
        assert_eq!(broker.order(&OrderId("o6".into())).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn tif_seq_limit_cancels_stale_resting_order() {
        let book = book_with(vec![("0.48", "50")], vec![]);
        let mut broker = Broker::new(BrokerConfig { tif_seq_limit: Some(5), ..BrokerConfig::default() });
        broker
            .submit(
                OrderId("o7".into()),
                asset(),
                OrderIntent { side: Side::Buy, price: d("0.48"), size: d("10"), tif: TimeInForce::Gtc },
                &book,
                1,
            )
            .unwrap();

        let transitions = broker.expire_tif(4);
        assert!(transitions.is_empty());
        assert_eq!(broker.order(&OrderId("o7".into())).unwrap().status, OrderStatus::Active);

        let transitions = broker.expire_tif(6);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].reason, "tif_seq_limit");
        assert_eq!(broker.order(&OrderId("o7".into())).unwrap().status, OrderStatus::Canceled);
    }
}
