use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|e| anyhow!("{key} invalid int: {e}")),
    }
}

fn get_env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = get_env(key).unwrap_or_else(|| default.to_string());
    Decimal::from_str(&raw).map_err(|e| anyhow!("{key} invalid decimal: {e}"))
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkMethod {
    BidForLong,
    Midpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealismMode {
    /// Fills only ever come from evidenced book depletion or resting-queue
    /// consumption; nothing is inferred from a bare marketable price.
    Strict,
    /// Same depletion model, plus trade-print events may additionally
    /// infer queue consumption (spec.md GLOSSARY "Realism mode").
    Relaxed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// `replay` reads a recorded tape; `shadow` drives live, paper-only.
    pub run_mode: String,

    // Network (shadow mode only)
    pub clob_ws_url: String,

    // Replay input / tape recording output
    pub tape_dir: Option<String>,
    pub record_tape_dir: Option<String>,
    pub asset_ids: Vec<String>,
    /// Asset `best_bid_ask.jsonl` is scoped to (spec.md §6). Defaults to
    /// the first entry of `asset_ids` when unset.
    pub primary_asset_id: Option<String>,

    // Run output
    pub run_output_dir: String,
    pub strategy: String,

    // Economics
    pub fee_rate: Decimal,
    pub fee_on_notional: bool,
    pub mark_method: MarkMethod,
    pub starting_cash: Decimal,
    pub min_order_notional: Decimal,
    pub default_tick_size: Decimal,

    // Broker realism
    pub realism_mode: RealismMode,
    pub cancel_latency_seq: u64,
    /// Maximum age, in events, a non-terminal order may rest before the
    /// broker cancels it outright (spec.md §3 Order entity).
    pub tif_seq_limit: Option<u64>,
    pub cancel_on_gap: bool,

    // Run controls
    pub seed: u64,
    pub max_counted_errors: u64,
    pub max_ws_stall_secs: u64,
    /// Softer threshold before the hard stall timeout; the shadow feed
    /// emits one `control:keepalive` event here (spec.md §8 scenario 6).
    pub keepalive_after_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let run_mode = get_env_string("RUN_MODE", "replay").to_lowercase();
        if !matches!(run_mode.as_str(), "replay" | "shadow") {
            return Err(anyhow!("RUN_MODE must be replay|shadow (got {run_mode})"));
        }

        let mark_method = match get_env_string("MARK_METHOD", "bid_for_long").to_lowercase().as_str() {
            "bid_for_long" => MarkMethod::BidForLong,
            "midpoint" => MarkMethod::Midpoint,
            other => return Err(anyhow!("MARK_METHOD must be bid_for_long|midpoint (got {other})")),
        };

        let realism_mode = match get_env_string("REALISM_MODE", "strict").to_lowercase().as_str() {
            "strict" => RealismMode::Strict,
            "relaxed" => RealismMode::Relaxed,
            other => return Err(anyhow!("REALISM_MODE must be strict|relaxed (got {other})")),
        };

        let asset_ids: Vec<String> = get_env_string("ASSET_IDS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_ws_stall_secs = get_env_u64("MAX_WS_STALL_SECS", 30)?;
        let default_keepalive = max_ws_stall_secs / 2;

        let s = Self {
            run_mode,
            clob_ws_url: get_env_string(
                "POLYMARKET_WS",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),
            tape_dir: get_env("TAPE_DIR"),
            record_tape_dir: get_env("RECORD_TAPE_DIR"),
            primary_asset_id: get_env("PRIMARY_ASSET_ID").or_else(|| asset_ids.first().cloned()),
            asset_ids,
            run_output_dir: get_env_string("RUN_OUTPUT_DIR", "./runs"),
            strategy: get_env_string("STRATEGY", "binary-complement-arb"),
            fee_rate: get_env_decimal("FEE_RATE", "0.02")?,
            fee_on_notional: get_env_bool("FEE_ON_NOTIONAL", false),
            mark_method,
            starting_cash: get_env_decimal("STARTING_CASH", "10000")?,
            min_order_notional: get_env_decimal("MIN_ORDER_NOTIONAL", "1")?,
            default_tick_size: get_env_decimal("DEFAULT_TICK_SIZE", "0.01")?,
            realism_mode,
            cancel_latency_seq: get_env_u64("CANCEL_LATENCY_SEQ", 0)?,
            tif_seq_limit: match get_env("TIF_SEQ_LIMIT") {
                None => None,
                Some(v) => Some(v.parse::<u64>().map_err(|e| anyhow!("TIF_SEQ_LIMIT invalid int: {e}"))?),
            },
            cancel_on_gap: get_env_bool("CANCEL_ON_GAP", true),
            seed: get_env_u64("SEED", 42)?,
            max_counted_errors: get_env_u64("MAX_COUNTED_ERRORS", 50)?,
            max_ws_stall_secs,
            keepalive_after_secs: get_env_u64("KEEPALIVE_AFTER_SECS", default_keepalive.max(1))?,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_mode == "replay" && self.tape_dir.is_none() {
            return Err(anyhow!("TAPE_DIR is required when RUN_MODE=replay"));
        }
        if self.run_mode == "shadow" && self.asset_ids.is_empty() {
            return Err(anyhow!("ASSET_IDS is required when RUN_MODE=shadow"));
        }
        if self.fee_rate < Decimal::ZERO {
            return Err(anyhow!("FEE_RATE must be >= 0 (got {})", self.fee_rate));
        }
        if self.default_tick_size <= Decimal::ZERO || self.default_tick_size >= Decimal::ONE {
            return Err(anyhow!(
                "DEFAULT_TICK_SIZE must be in (0,1) (got {})",
                self.default_tick_size
            ));
        }
        if self.min_order_notional < Decimal::ZERO {
            return Err(anyhow!(
                "MIN_ORDER_NOTIONAL must be >= 0 (got {})",
                self.min_order_notional
            ));
        }
        if self.max_ws_stall_secs < 1 {
            return Err(anyhow!("MAX_WS_STALL_SECS must be >= 1 (got {})", self.max_ws_stall_secs));
        }
        if self.keepalive_after_secs >= self.max_ws_stall_secs {
            return Err(anyhow!(
                "KEEPALIVE_AFTER_SECS must be < MAX_WS_STALL_SECS (got {} >= {})",
                self.keepalive_after_secs,
                self.max_ws_stall_secs
            ));
        }
        Ok(())
    }
}
