//! Append-only tape writer (spec.md §4.1 Recorder, §6 on-disk layout).
//!
//! Opens two JSON-line files per tape plus a `meta.json` summary, and
//! guarantees flush-on-write so a crash loses at most one partial line.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::ids::{AssetId, TapeId};
use crate::tape::schema::{ControlSubkind, Event, Payload, RawFrame, TapeMeta};
use crate::utils::now_ms;

pub struct Recorder {
    dir: PathBuf,
    raw_writer: BufWriter<File>,
    events_writer: BufWriter<File>,
    meta: TapeMeta,
    next_seq: u64,
    next_frame_seq: u64,
    last_snapshot_hash: std::collections::HashMap<AssetId, String>,
}

impl Recorder {
    /// Creates a fresh tape directory. Refuses to overwrite an existing one
    /// (spec.md §4.1).
    pub fn create(dir: impl AsRef<Path>, tape_id: TapeId, asset_ids: BTreeSet<AssetId>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            bail!("tape directory already exists: {}", dir.display());
        }
        fs::create_dir_all(&dir).with_context(|| format!("create tape dir {}", dir.display()))?;

        let raw_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(dir.join("raw_ws.jsonl"))
            .context("open raw_ws.jsonl")?;
        let events_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(dir.join("events.jsonl"))
            .context("open events.jsonl")?;

        let meta = TapeMeta::new(tape_id, asset_ids, now_ms());

        Ok(Self {
            dir,
            raw_writer: BufWriter::new(raw_file),
            events_writer: BufWriter::new(events_file),
            meta,
            next_seq: 0,
            next_frame_seq: 0,
            last_snapshot_hash: Default::default(),
        })
    }

    /// Appends the raw bytes of a wire frame, exactly as received.
    pub fn record_raw_frame(&mut self, raw: serde_json::Value) -> Result<u64> {
        let frame_seq = self.next_frame_seq;
        self.next_frame_seq += 1;
        let frame = RawFrame {
            frame_seq,
            ts_recv_ms: now_ms(),
            raw,
        };
        serde_json::to_writer(&mut self.raw_writer, &frame)?;
        self.raw_writer.write_all(b"\n")?;
        self.raw_writer.flush().context("flush raw_ws.jsonl")?;
        self.meta.frame_count += 1;
        Ok(frame_seq)
    }

    /// Appends one or more normalized events produced from a single wire
    /// frame, assigning dense `seq` values in wire-order (spec.md §4.1 (ii)).
    pub fn record_events(&mut self, ts_recv_ms: i64, asset_id: AssetId, payloads: Vec<Payload>) -> Result<Vec<Event>> {
        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if let Payload::BookSnapshot { hash, .. } = &payload {
                if !self.meta.first_snapshot_seq_by_asset.contains_key(&asset_id) {
                    self.meta
                        .first_snapshot_seq_by_asset
                        .insert(asset_id.clone(), self.next_seq);
                }
                self.last_snapshot_hash.insert(asset_id.clone(), hash.clone());
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            let event = Event::new(seq, ts_recv_ms, asset_id.clone(), payload);
            serde_json::to_writer(&mut self.events_writer, &event)?;
            self.events_writer.write_all(b"\n")?;
            self.meta.event_count += 1;
            out.push(event);
        }
        self.events_writer.flush().context("flush events.jsonl")?;
        Ok(out)
    }

    /// Emits a `control:ws_reconnect` event, and a following `control:ws_gap`
    /// if the caller detected that the post-reconnect snapshot disagrees
    /// with the last known state for `asset_id` (spec.md §4.1 (iii)).
    pub fn record_reconnect(&mut self, asset_id: AssetId, gap_suspected: bool) -> Result<()> {
        let ts = now_ms();
        self.record_events(ts, asset_id.clone(), vec![Payload::Control {
            subkind: ControlSubkind::WsReconnect,
        }])?;
        self.meta.reconnects += 1;
        if gap_suspected {
            self.record_events(ts, asset_id, vec![Payload::Control {
                subkind: ControlSubkind::WsGap,
            }])?;
            self.meta.gaps += 1;
        }
        Ok(())
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("tape.recorder.warning {}", message);
        self.meta.warnings.push(message);
    }

    /// Closes the tape, writing the final `meta.json`.
    pub fn close(mut self) -> Result<()> {
        self.raw_writer.flush().ok();
        self.events_writer.flush().ok();
        let meta_path = self.dir.join("meta.json");
        let f = File::create(&meta_path).with_context(|| format!("create {}", meta_path.display()))?;
        serde_json::to_writer_pretty(f, &self.meta).context("write meta.json")?;
        log::info!(
            "tape.recorder.closed dir={} events={} frames={}",
            self.dir.display(),
            self.meta.event_count,
            self.meta.frame_count
        );
        Ok(())
    }
}
