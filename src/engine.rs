//! Run Engine (spec.md §4.6): the single-threaded deterministic loop that
//! turns one tape (or, via `shadow.rs`, a live feed) plus one strategy
//! into a run's artifacts.
//!
//! Each event is applied in full -- book, broker queue consumption,
//! strategy invocation, new-order submission, mark-to-market -- before
//! the next one is read. Nothing here spawns a thread; determinism comes
//! from that strict ordering, not from locking.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::artifacts::{
    ArtifactSinks, BestBidAskRecord, DecisionRecord, EquityCurveRecord, FillRecord, LedgerRecord, OrderRecord,
    RunManifest, RunSource, StateTransitionRecord,
};
use crate::book::Book;
use crate::broker::{Broker, BrokerConfig, Fill, OrderIntent as BrokerOrderIntent, Transition};
use crate::error::SimError;
use crate::ids::{AssetId, OrderId, RunId};
use crate::portfolio::{Portfolio, PortfolioConfig};
use crate::strategy::{Strategy, StrategyContext};
use crate::tape::schema::{ControlSubkind, Event, Payload};
use crate::utils::now_ms;

pub struct EngineConfig {
    pub run_id: RunId,
    pub source: RunSource,
    pub starting_cash: Decimal,
    pub broker: BrokerConfig,
    pub portfolio: PortfolioConfig,
    pub default_tick_size: Decimal,
    /// Once this many non-fatal errors have been counted, escalate and
    /// abort the run rather than continue degraded (spec.md §7).
    pub max_counted_errors: u64,
    /// `best_bid_ask.jsonl` is scoped to this one asset (spec.md §6).
    pub primary_asset_id: Option<AssetId>,
    pub cancel_on_gap: bool,
    /// `strict`/`relaxed`, recorded verbatim into the run manifest
    /// (spec.md §4.3: "realism_mode = relaxed ... must be recorded in
    /// artifacts").
    pub realism_mode: String,
    /// Every asset this run is expected to observe a `book_snapshot` for;
    /// a run that ends without one is `run_quality=invalid` (spec.md §4.2).
    pub tracked_asset_ids: Vec<AssetId>,
}

pub struct Engine {
    cfg: EngineConfig,
    strategy: Box<dyn Strategy + Send>,
    books: BTreeMap<AssetId, Book>,
    broker: Broker,
    portfolio: Portfolio,
    sinks: ArtifactSinks,
    counted_errors: u64,
    events_applied: u64,
    events_skipped: u64,
    orders_submitted: u64,
    orders_filled: u64,
    orders_cancelled: u64,
    orders_rejected: u64,
    fill_count: u64,
}

impl Engine {
    pub fn new(cfg: EngineConfig, strategy: Box<dyn Strategy + Send>, sinks: ArtifactSinks) -> Self {
        let broker = Broker::new(BrokerConfig {
            min_order_notional: cfg.broker.min_order_notional,
            cancel_latency_seq: cfg.broker.cancel_latency_seq,
            strict_realism: cfg.broker.strict_realism,
            tif_seq_limit: cfg.broker.tif_seq_limit,
        });
        let portfolio = Portfolio::new(cfg.portfolio, cfg.starting_cash);
        Self {
            cfg,
            strategy,
            books: BTreeMap::new(),
            broker,
            portfolio,
            sinks,
            counted_errors: 0,
            events_applied: 0,
            events_skipped: 0,
            orders_submitted: 0,
            orders_filled: 0,
            orders_cancelled: 0,
            orders_rejected: 0,
            fill_count: 0,
        }
    }

    /// Drives the engine to completion over `events`, writing all
    /// artifacts and the final manifest. Used for both tape replay
    /// (`TapeReader`) and shadow mode (a channel-backed iterator).
    pub fn run(mut self, events: impl Iterator<Item = Result<Event, SimError>>) -> anyhow::Result<()> {
        let started_at_ms = now_ms();
        let mut exit_reason = "end_of_tape".to_string();

        for item in events {
            let event = match item {
                Ok(e) => e,
                Err(e) => {
                    log::error!("engine.tape_error {}", e);
                    exit_reason = match e {
                        SimError::FeedTimeout { .. } => "ws_stall".to_string(),
                        SimError::DeadlineExceeded => "deadline".to_string(),
                        _ => "error".to_string(),
                    };
                    break;
                }
            };
            let seq = event.seq;

            if let Err(e) = self.apply_to_book(seq, &event.asset_id, &event.payload) {
                self.note_error(&e, seq, &event.asset_id);
                self.events_skipped += 1;
                if e.is_fatal() || self.counted_errors > self.cfg.max_counted_errors {
                    exit_reason = "error".to_string();
                    break;
                }
                continue;
            }
            self.events_applied += 1;

            let (fills, transitions) = self.broker.on_book_update(&event.asset_id, self.books.get(&event.asset_id).expect("book applied"), seq);
            self.settle_fills(&event.asset_id, fills)?;
            self.record_transitions(seq, transitions)?;

            if let Payload::LastTradePrice { price, size, side, .. } = &event.payload {
                let (fills, transitions) = self.broker.on_trade_print(*price, *size, *side, seq);
                self.settle_fills(&event.asset_id, fills)?;
                self.record_transitions(seq, transitions)?;
            }

            if let Payload::Control { subkind: ControlSubkind::WsGap } = &event.payload {
                if self.cfg.cancel_on_gap {
                    let transitions = self.broker.cancel_on_gap(seq);
                    self.record_transitions(seq, transitions)?;
                }
            }

            let expired = self.broker.expire_cancels(seq);
            self.record_transitions(seq, expired)?;

            let tif_expired = self.broker.expire_tif(seq);
            self.record_transitions(seq, tif_expired)?;

            // spec.md §8 testable property 3: the strategy callback is never
            // invoked while any subscribed asset's book is locked or crossed.
            let locked = self
                .books
                .values()
                .any(|b| matches!(b.status(), crate::book::BookStatus::Locked | crate::book::BookStatus::Crossed));

            let mut rejected_reasons_map: BTreeMap<String, u64> = BTreeMap::new();
            let mut intents_submitted_count: u64 = 0;
            let mut intents_cancelled_count: u64 = 0;

            if !locked {
                let open_orders: Vec<_> = self.broker.open_orders().collect();
                let ctx = StrategyContext {
                    event: &event,
                    books: &self.books,
                    portfolio: &self.portfolio,
                    open_orders,
                    seq,
                };
                let (intents, cancels) = self.strategy.on_event(&ctx);
                intents_cancelled_count = cancels.len() as u64;

                for cancel in cancels {
                    self.broker.request_cancel(&cancel.order_id, seq).ok();
                }

                for intent in intents {
                    let order_id = OrderId(uuid::Uuid::new_v4().to_string());
                    let asset_id = intent.asset_id.clone();
                    let Some(book) = self.books.get(&asset_id) else { continue };
                    let broker_intent = BrokerOrderIntent {
                        side: intent.side,
                        price: intent.price,
                        size: intent.size,
                        tif: intent.tif,
                    };
                    match self.broker.submit(order_id.clone(), asset_id.clone(), broker_intent, book, seq) {
                        Ok(transition) => {
                            self.orders_submitted += 1;
                            intents_submitted_count += 1;
                            self.record_transitions(seq, vec![transition])?;
                        }
                        Err(e) => {
                            self.orders_rejected += 1;
                            if let SimError::OrderValidationError { reason, .. } = &e {
                                *rejected_reasons_map.entry(reason.clone()).or_insert(0) += 1;
                            }
                            self.note_error(&e, seq, &asset_id);
                        }
                    }
                }
            }

            self.sinks.record_decision(&DecisionRecord {
                seq,
                event_kind: event.kind,
                asset_id: event.asset_id.clone(),
                rejected_reasons_map,
                intents_submitted_count,
                intents_cancelled_count,
            })?;

            self.mark_and_record(seq, event.ts_recv_ms)?;
        }

        let final_seq = self.books.values().filter_map(|b| b.last_seq()).max().unwrap_or(0);
        let final_transitions = self.broker.cancel_all_resting(&exit_reason);
        self.record_transitions(final_seq, final_transitions)?;

        let run_quality = self.resolve_run_quality(&exit_reason);
        self.sinks.finish(RunManifest {
            run_id: self.cfg.run_id.clone(),
            strategy: self.strategy.name().to_string(),
            source: self.cfg.source.clone(),
            started_at_ms,
            finished_at_ms: now_ms(),
            events_applied: self.events_applied,
            events_skipped: self.events_skipped,
            orders_submitted: self.orders_submitted,
            orders_filled: self.orders_filled,
            orders_cancelled: self.orders_cancelled,
            orders_rejected: self.orders_rejected,
            fill_count: self.fill_count,
            realized_pnl_total: self.portfolio.realized_pnl_total(),
            fees_paid_total: self.portfolio.fees_paid_total(),
            run_quality,
            realism_mode: self.cfg.realism_mode.clone(),
            exit_reason,
            stream_hashes: BTreeMap::new(),
        })?;
        Ok(())
    }

    /// Resolves the final `run_quality` per spec.md §4.2's staged
    /// escalation: `ok -> warnings -> degraded`, keyed on the fraction of
    /// events skipped (default threshold >5%) and on any non-fatal counted
    /// error; `invalid` overrides everything else when a tracked asset
    /// never saw a `book_snapshot` at all.
    fn resolve_run_quality(&self, exit_reason: &str) -> String {
        let never_saw_snapshot = self
            .cfg
            .tracked_asset_ids
            .iter()
            .any(|asset_id| !self.books.get(asset_id).map(|b| b.is_initialized()).unwrap_or(false));
        if never_saw_snapshot {
            return "invalid".to_string();
        }

        let total_events = self.events_applied + self.events_skipped;
        let skipped_fraction = if total_events > 0 {
            self.events_skipped as f64 / total_events as f64
        } else {
            0.0
        };

        if skipped_fraction > 0.05 || exit_reason == "ws_stall" {
            "degraded".to_string()
        } else if self.counted_errors > 0 {
            "warnings".to_string()
        } else {
            "ok".to_string()
        }
    }

    fn apply_to_book(&mut self, seq: u64, asset_id: &AssetId, payload: &Payload) -> Result<(), SimError> {
        let book = self
            .books
            .entry(asset_id.clone())
            .or_insert_with(|| Book::new(asset_id.clone(), self.cfg.default_tick_size));
        book.apply(seq, payload)
    }

    fn settle_fills(&mut self, asset_id: &AssetId, fills: Vec<Fill>) -> anyhow::Result<()> {
        for fill in fills {
            self.fill_count += 1;
            let fee_charged = self.portfolio.apply_fill(asset_id, fill.side, fill.price, fill.size)?;
            self.sinks.record_fill(&FillRecord {
                seq: fill.seq,
                fill_id: fill.fill_id,
                order_id: fill.order_id,
                asset_id: asset_id.clone(),
                side: fill.side,
                price: fill.price,
                size: fill.size,
                fee_charged,
            })?;
        }
        Ok(())
    }

    /// Writes one `orders.jsonl` row per lifecycle transition and tallies
    /// the running fill/cancel counters used in the final manifest.
    fn record_transitions(&mut self, seq: u64, transitions: Vec<Transition>) -> anyhow::Result<()> {
        for t in transitions {
            match t.to {
                "filled" => self.orders_filled += 1,
                "cancelled" => self.orders_cancelled += 1,
                _ => {}
            }
            self.sinks.record_order(&OrderRecord {
                seq,
                order_id: t.order_id,
                asset_id: t.asset_id,
                state_transition: StateTransitionRecord { from: t.from, to: t.to, reason: t.reason },
            })?;
        }
        Ok(())
    }

    fn mark_and_record(&mut self, seq: u64, ts_recv_ms: i64) -> anyhow::Result<()> {
        let equity = self.portfolio.equity(&self.books);
        self.sinks.record_equity(&EquityCurveRecord { seq, ts_recv_ms, equity })?;
        self.sinks.record_ledger(&LedgerRecord { seq, cash: self.portfolio.cash, positions: self.portfolio.snapshot() })?;

        if let Some(primary) = self.cfg.primary_asset_id.clone() {
            if let Some(book) = self.books.get(&primary) {
                self.sinks.record_best_bid_ask(&BestBidAskRecord {
                    seq,
                    best_bid: book.best_bid().map(|(p, _)| p),
                    best_bid_size: book.best_bid().map(|(_, s)| s),
                    best_ask: book.best_ask().map(|(p, _)| p),
                    best_ask_size: book.best_ask().map(|(_, s)| s),
                })?;
            }
        }
        Ok(())
    }

    fn note_error(&mut self, e: &SimError, seq: u64, asset_id: &AssetId) {
        log::warn!("engine.counted_error {}", e);
        self.sinks.record_warning(seq, asset_id, &e.to_string());
        self.counted_errors += 1;
    }
}

