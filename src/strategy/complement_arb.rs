//! `binary-complement-arb`: buys both legs of a YES/NO pair whenever their
//! resting ask prices sum to less than 1 minus a fee cushion, generalizing
//! the teacher's multi-leg basket-sum arbitrage check down to the two-leg
//! complement case (spec.md §4.5).

use rust_decimal::Decimal;

use crate::broker::TimeInForce;
use crate::ids::AssetId;
use crate::tape::schema::Side;

use super::{CancelIntent, OrderIntent, Strategy, StrategyContext};

pub struct ComplementArbConfig {
    pub yes_asset: AssetId,
    pub no_asset: AssetId,
    /// Minimum discount below 1.0 (after fees) required to enter.
    pub fee_threshold: Decimal,
    pub max_leg_size: Decimal,
    /// Sequence numbers to wait for the lagging leg to fill before giving
    /// up and unwinding the filled leg at market.
    pub unwind_wait_seq: u64,
}

pub struct ComplementArbStrategy {
    cfg: ComplementArbConfig,
    /// `seq` the pair was entered at, kept for the unwind clock. Fill state
    /// itself is read fresh from `ctx` each call rather than cached here --
    /// the broker's conservative model means a submitted leg can sit
    /// resting for an arbitrary number of events before it fills or is
    /// swept, so there is nothing safe to remember about it up front.
    pair_entered_seq: Option<u64>,
}

impl ComplementArbStrategy {
    pub fn new(cfg: ComplementArbConfig) -> Self {
        Self { cfg, pair_entered_seq: None }
    }
}

/// Whether this strategy still has a resting (unresolved) order open on
/// `asset_id`. The engine runs one strategy against the broker, so every
/// resting order in `ctx.open_orders` belongs to it.
fn has_resting_order(ctx: &StrategyContext<'_>, asset_id: &AssetId) -> bool {
    ctx.open_orders.iter().any(|o| &o.asset_id == asset_id)
}

impl Strategy for ComplementArbStrategy {
    fn name(&self) -> &'static str {
        "binary-complement-arb"
    }

    fn on_event(&mut self, ctx: &StrategyContext<'_>) -> (Vec<OrderIntent>, Vec<CancelIntent>) {
        let mut intents = Vec::new();
        let mut cancels = Vec::new();

        let yes_book = ctx.book(&self.cfg.yes_asset);
        let no_book = ctx.book(&self.cfg.no_asset);
        let (Some(yes), Some(no)) = (yes_book, no_book) else {
            return (intents, cancels);
        };

        let yes_qty = ctx.portfolio.position(&self.cfg.yes_asset).map(|p| p.net_qty).unwrap_or(Decimal::ZERO);
        let no_qty = ctx.portfolio.position(&self.cfg.no_asset).map(|p| p.net_qty).unwrap_or(Decimal::ZERO);
        let yes_resting = has_resting_order(ctx, &self.cfg.yes_asset);
        let no_resting = has_resting_order(ctx, &self.cfg.no_asset);
        let pair_in_flight = yes_resting || no_resting || !yes_qty.is_zero() || !no_qty.is_zero();

        if !pair_in_flight {
            self.pair_entered_seq = None;
        }

        if let (Some((yes_ask, yes_depth)), Some((no_ask, no_depth))) = (yes.book.best_ask(), no.book.best_ask()) {
            let sum = yes_ask + no_ask;
            if !pair_in_flight && sum < Decimal::ONE - self.cfg.fee_threshold {
                let size = yes_depth.min(no_depth).min(self.cfg.max_leg_size);
                if size > Decimal::ZERO {
                    intents.push(OrderIntent {
                        asset_id: self.cfg.yes_asset.clone(),
                        side: Side::Buy,
                        price: yes_ask,
                        size,
                        tif: TimeInForce::Ioc,
                    });
                    intents.push(OrderIntent {
                        asset_id: self.cfg.no_asset.clone(),
                        side: Side::Buy,
                        price: no_ask,
                        size,
                        tif: TimeInForce::Ioc,
                    });
                    self.pair_entered_seq = Some(ctx.seq);
                }
            }
        }

        // One leg has filled (a position exists) while the other is still
        // resting past the wait window: unwind the filled leg back out
        // rather than carry unmatched directional risk, and give up on the
        // stale leg so it stops waiting for a fill that isn't coming.
        if let Some(entered_seq) = self.pair_entered_seq {
            if ctx.seq.saturating_sub(entered_seq) > self.cfg.unwind_wait_seq {
                if !yes_qty.is_zero() && no_resting && no_qty.is_zero() {
                    if let Some((bid, depth)) = yes.book.best_bid() {
                        intents.push(OrderIntent {
                            asset_id: self.cfg.yes_asset.clone(),
                            side: Side::Sell,
                            price: bid,
                            size: yes_qty.abs().min(depth).min(self.cfg.max_leg_size),
                            tif: TimeInForce::Ioc,
                        });
                    }
                    for order in &ctx.open_orders {
                        if order.asset_id == self.cfg.no_asset {
                            cancels.push(CancelIntent { order_id: order.order_id.clone() });
                        }
                    }
                } else if !no_qty.is_zero() && yes_resting && yes_qty.is_zero() {
                    if let Some((bid, depth)) = no.book.best_bid() {
                        intents.push(OrderIntent {
                            asset_id: self.cfg.no_asset.clone(),
                            side: Side::Sell,
                            price: bid,
                            size: no_qty.abs().min(depth).min(self.cfg.max_leg_size),
                            tif: TimeInForce::Ioc,
                        });
                    }
                    for order in &ctx.open_orders {
                        if order.asset_id == self.cfg.yes_asset {
                            cancels.push(CancelIntent { order_id: order.order_id.clone() });
                        }
                    }
                }
            }
        }

        (intents, cancels)
    }
}
