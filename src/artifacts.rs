//! Run artifact sinks (spec.md §4.6, §6 on-disk layout).
//!
//! Each sink is an append-only JSON-lines file; `run_manifest.json` and the
//! companion `meta.json` are written once, at the very end of a run.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, FillId, OrderId, RunId, TapeId};
use crate::portfolio::PositionSnapshot;
use crate::tape::schema::{EventKind, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub seq: u64,
    pub event_kind: EventKind,
    pub asset_id: AssetId,
    pub rejected_reasons_map: BTreeMap<String, u64>,
    pub intents_submitted_count: u64,
    pub intents_cancelled_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub from: &'static str,
    pub to: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub seq: u64,
    pub order_id: OrderId,
    pub asset_id: AssetId,
    pub state_transition: StateTransitionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub seq: u64,
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub asset_id: AssetId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee_charged: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq: u64,
    pub cash: Decimal,
    pub positions: BTreeMap<AssetId, PositionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurveRecord {
    pub seq: u64,
    pub ts_recv_ms: i64,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestBidAskRecord {
    pub seq: u64,
    pub best_bid: Option<Decimal>,
    pub best_bid_size: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub best_ask_size: Option<Decimal>,
}

/// Where a run's events came from, for `run_manifest.json` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Tape { tape_id: TapeId, tape_dir: String },
    Shadow { session_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub strategy: String,
    pub source: RunSource,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub orders_submitted: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
    pub fill_count: u64,
    pub realized_pnl_total: Decimal,
    pub fees_paid_total: Decimal,
    /// One of `ok`, `warnings`, `degraded`, `invalid` (spec.md §3, §4.2).
    pub run_quality: String,
    /// `strict` or `relaxed`; `relaxed` must be recorded in artifacts
    /// per spec.md §4.3.
    pub realism_mode: String,
    pub exit_reason: String,
    /// Stable (non-randomized) hash of each `.jsonl` stream's bytes, keyed
    /// by file name, so two runs over identical inputs can be diffed
    /// without re-reading the files (spec.md §8 property 2, determinism).
    pub stream_hashes: BTreeMap<String, u64>,
}

/// Short human summary written alongside the manifest (spec.md §6 run
/// `meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_quality: String,
    pub realism_mode: String,
    pub exit_reason: String,
    pub warnings: Vec<String>,
}

/// An append-only JSONL file that also accumulates a stable hash of
/// everything written to it, using `DefaultHasher`'s fixed initial state
/// (unlike `HashMap`'s `RandomState`) so the hash is reproducible across
/// runs and processes given identical content.
struct JsonlSink {
    writer: BufWriter<File>,
    hasher: DefaultHasher,
}

impl JsonlSink {
    fn create(path: &Path) -> Result<Self> {
        let f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self { writer: BufWriter::new(f), hasher: DefaultHasher::new() })
    }

    fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        bytes.hash(&mut self.hasher);
        self.writer.write_all(&bytes)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn finish_hash(&self) -> u64 {
        self.hasher.finish()
    }
}

/// Bundles every per-run output sink named in spec.md §6.
pub struct ArtifactSinks {
    dir: PathBuf,
    decisions: JsonlSink,
    orders: JsonlSink,
    fills: JsonlSink,
    ledger: JsonlSink,
    equity_curve: JsonlSink,
    best_bid_ask: JsonlSink,
    warnings: Vec<String>,
}

impl ArtifactSinks {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            bail!("run directory already exists: {}", dir.display());
        }
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        Ok(Self {
            decisions: JsonlSink::create(&dir.join("decisions.jsonl"))?,
            orders: JsonlSink::create(&dir.join("orders.jsonl"))?,
            fills: JsonlSink::create(&dir.join("fills.jsonl"))?,
            ledger: JsonlSink::create(&dir.join("ledger.jsonl"))?,
            equity_curve: JsonlSink::create(&dir.join("equity_curve.jsonl"))?,
            best_bid_ask: JsonlSink::create(&dir.join("best_bid_ask.jsonl"))?,
            warnings: Vec::new(),
            dir,
        })
    }

    pub fn record_decision(&mut self, r: &DecisionRecord) -> Result<()> {
        self.decisions.write(r)
    }
    pub fn record_order(&mut self, r: &OrderRecord) -> Result<()> {
        self.orders.write(r)
    }
    pub fn record_fill(&mut self, r: &FillRecord) -> Result<()> {
        self.fills.write(r)
    }
    pub fn record_ledger(&mut self, r: &LedgerRecord) -> Result<()> {
        self.ledger.write(r)
    }
    pub fn record_equity(&mut self, r: &EquityCurveRecord) -> Result<()> {
        self.equity_curve.write(r)
    }
    pub fn record_best_bid_ask(&mut self, r: &BestBidAskRecord) -> Result<()> {
        self.best_bid_ask.write(r)
    }

    /// Records a warning for this run's `meta.json`, with enough context to
    /// locate the offending event (spec.md §7 "User-visible behavior").
    pub fn record_warning(&mut self, seq: u64, asset_id: &AssetId, reason: &str) {
        self.warnings.push(format!("seq={seq} asset={asset_id} reason={reason}"));
    }

    pub fn finish(self, mut manifest: RunManifest) -> Result<()> {
        manifest.stream_hashes.insert("decisions.jsonl".to_string(), self.decisions.finish_hash());
        manifest.stream_hashes.insert("orders.jsonl".to_string(), self.orders.finish_hash());
        manifest.stream_hashes.insert("fills.jsonl".to_string(), self.fills.finish_hash());
        manifest.stream_hashes.insert("ledger.jsonl".to_string(), self.ledger.finish_hash());
        manifest.stream_hashes.insert("equity_curve.jsonl".to_string(), self.equity_curve.finish_hash());
        manifest.stream_hashes.insert("best_bid_ask.jsonl".to_string(), self.best_bid_ask.finish_hash());

        let manifest_path = self.dir.join("run_manifest.json");
        let f = File::create(&manifest_path).with_context(|| format!("create {}", manifest_path.display()))?;
        serde_json::to_writer_pretty(f, &manifest).context("write run_manifest.json")?;

        let meta = RunMeta {
            run_quality: manifest.run_quality.clone(),
            realism_mode: manifest.realism_mode.clone(),
            exit_reason: manifest.exit_reason.clone(),
            warnings: self.warnings,
        };
        let meta_path = self.dir.join("meta.json");
        let f = File::create(&meta_path).with_context(|| format!("create {}", meta_path.display()))?;
        serde_json::to_writer_pretty(f, &meta).context("write run meta.json")?;

        log::info!(
            "engine.run.finished run_id={} events={} fills={} quality={}",
            manifest.run_id, manifest.events_applied, manifest.fill_count, manifest.run_quality
        );
        Ok(())
    }
}
