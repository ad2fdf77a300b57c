//! `replay-trades`: copies external trade prints observed on the tape,
//! submitting a scaled-down marketable order in the same direction each
//! time one occurs (spec.md §4.5).

use rust_decimal::Decimal;

use crate::broker::TimeInForce;
use crate::ids::AssetId;
use crate::tape::schema::Payload;

use super::{CancelIntent, OrderIntent, Strategy, StrategyContext};

pub struct ReplayTradesConfig {
    pub asset_id: AssetId,
    /// Fraction of the observed trade's size to copy, e.g. 0.1 for 10%.
    pub size_scale: Decimal,
    pub max_order_size: Decimal,
}

pub struct ReplayTradesStrategy {
    cfg: ReplayTradesConfig,
}

impl ReplayTradesStrategy {
    pub fn new(cfg: ReplayTradesConfig) -> Self {
        Self { cfg }
    }
}

impl Strategy for ReplayTradesStrategy {
    fn name(&self) -> &'static str {
        "replay-trades"
    }

    fn on_event(&mut self, ctx: &StrategyContext<'_>) -> (Vec<OrderIntent>, Vec<CancelIntent>) {
        if ctx.event.asset_id != self.cfg.asset_id {
            return (Vec::new(), Vec::new());
        }
        let Payload::LastTradePrice { price, size, side, .. } = &ctx.event.payload else {
            return (Vec::new(), Vec::new());
        };

        let copy_size = (*size * self.cfg.size_scale).min(self.cfg.max_order_size);
        if copy_size <= Decimal::ZERO {
            return (Vec::new(), Vec::new());
        }

        let intent = OrderIntent {
            asset_id: self.cfg.asset_id.clone(),
            side: *side,
            price: *price,
            size: copy_size,
            tif: TimeInForce::Ioc,
        };
        (vec![intent], Vec::new())
    }
}
