//! Versioned event and frame record definitions, and the normalization
//! target every wire frame is reduced to (spec.md §3, §4.1).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::AssetId;

/// The parser version this crate understands. Events carrying any other
/// value are rejected by the reader (spec.md §3 Event.parser_version).
pub const CURRENT_PARSER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BookSnapshot,
    PriceChange,
    LastTradePrice,
    TickSizeChange,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSubkind {
    WsOpen,
    WsReconnect,
    WsGap,
    Keepalive,
    Eof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChangeEntry {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    BookSnapshot {
        asks: Vec<PriceLevel>,
        bids: Vec<PriceLevel>,
        tick_size: Decimal,
        hash: String,
    },
    PriceChange(Vec<PriceChangeEntry>),
    LastTradePrice {
        price: Decimal,
        size: Decimal,
        side: Side,
        trade_id: String,
    },
    TickSizeChange {
        tick_size: Decimal,
    },
    Control {
        subkind: ControlSubkind,
    },
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::BookSnapshot { .. } => EventKind::BookSnapshot,
            Payload::PriceChange(_) => EventKind::PriceChange,
            Payload::LastTradePrice { .. } => EventKind::LastTradePrice,
            Payload::TickSizeChange { .. } => EventKind::TickSizeChange,
            Payload::Control { .. } => EventKind::Control,
        }
    }
}

/// One normalized market event. Immutable once written (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts_recv_ms: i64,
    pub asset_id: AssetId,
    pub kind: EventKind,
    pub payload: Payload,
    pub parser_version: u32,
}

impl Event {
    /// Constructs an event, deriving `kind` from `payload` so the two JSON
    /// fields can never disagree.
    pub fn new(seq: u64, ts_recv_ms: i64, asset_id: AssetId, payload: Payload) -> Self {
        Self {
            seq,
            ts_recv_ms,
            asset_id,
            kind: payload.kind(),
            payload,
            parser_version: CURRENT_PARSER_VERSION,
        }
    }
}

/// Raw wire frame, exactly as received (spec.md §6 `raw_ws.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub frame_seq: u64,
    pub ts_recv_ms: i64,
    pub raw: serde_json::Value,
}

/// Tape-level metadata (spec.md §6 `meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeMeta {
    pub tape_id: crate::ids::TapeId,
    pub created_at_ms: i64,
    pub asset_ids: BTreeSet<AssetId>,
    pub parser_version: u32,
    pub recorder_version: u32,
    pub frame_count: u64,
    pub event_count: u64,
    pub reconnects: u64,
    pub gaps: u64,
    pub first_snapshot_seq_by_asset: std::collections::BTreeMap<AssetId, u64>,
    pub warnings: Vec<String>,
}

impl TapeMeta {
    pub fn new(tape_id: crate::ids::TapeId, asset_ids: BTreeSet<AssetId>, created_at_ms: i64) -> Self {
        Self {
            tape_id,
            created_at_ms,
            asset_ids,
            parser_version: CURRENT_PARSER_VERSION,
            recorder_version: 1,
            frame_count: 0,
            event_count: 0,
            reconnects: 0,
            gaps: 0,
            first_snapshot_seq_by_asset: Default::default(),
            warnings: Vec::new(),
        }
    }
}
