//! Restartable, finite, lazy reader over a tape's `events.jsonl` (spec.md
//! §4.1 Reader).

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::SimError;
use crate::ids::AssetId;
use crate::tape::schema::{Event, EventKind, Payload, TapeMeta, CURRENT_PARSER_VERSION};

/// Re-opens `events.jsonl` from the start every time `reader()` is called,
/// so a tape can be read any number of times (spec.md §8 restartability).
pub struct TapeSource {
    dir: PathBuf,
    pub meta: TapeMeta,
}

impl TapeSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta_path = dir.join("meta.json");
        let meta_file = File::open(&meta_path).with_context(|| format!("open {}", meta_path.display()))?;
        let meta: TapeMeta = serde_json::from_reader(meta_file).context("parse meta.json")?;
        Ok(Self { dir, meta })
    }

    pub fn reader(&self) -> Result<TapeReader> {
        let events_path = self.dir.join("events.jsonl");
        let f = File::open(&events_path).with_context(|| format!("open {}", events_path.display()))?;
        Ok(TapeReader {
            lines: BufReader::new(f).lines(),
            asset_ids: self.meta.asset_ids.clone(),
            seen_snapshot: HashSet::new(),
            expected_seq: 0,
            done: false,
        })
    }
}

/// Forward-only, finite iterator of validated [`Event`]s. Yields
/// `Err(SimError::TapeCorrupt)` and stops permanently on the first
/// structural violation.
pub struct TapeReader {
    lines: std::io::Lines<BufReader<File>>,
    asset_ids: BTreeSet<AssetId>,
    seen_snapshot: HashSet<AssetId>,
    expected_seq: u64,
    done: bool,
}

impl Iterator for TapeReader {
    type Item = Result<Event, SimError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let line = match self.lines.next() {
            None => {
                self.done = true;
                return None;
            }
            Some(Ok(l)) if l.trim().is_empty() => return self.next(),
            Some(Ok(l)) => l,
            Some(Err(e)) => {
                self.done = true;
                return Some(Err(SimError::TapeCorrupt {
                    seq: None,
                    reason: format!("io error reading events.jsonl: {e}"),
                }));
            }
        };

        let event: Event = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                self.done = true;
                return Some(Err(SimError::TapeCorrupt {
                    seq: None,
                    reason: format!("malformed event record: {e}"),
                }));
            }
        };

        if let Err(e) = self.validate(&event) {
            self.done = true;
            return Some(Err(e));
        }

        if event.payload.kind() == EventKind::BookSnapshot {
            self.seen_snapshot.insert(event.asset_id.clone());
        }
        self.expected_seq = event.seq + 1;
        Some(Ok(event))
    }
}

impl TapeReader {
    fn validate(&self, event: &Event) -> Result<(), SimError> {
        if event.parser_version != CURRENT_PARSER_VERSION {
            return Err(SimError::TapeCorrupt {
                seq: Some(event.seq),
                reason: format!("unknown parser_version {}", event.parser_version),
            });
        }
        if event.seq != self.expected_seq {
            return Err(SimError::TapeCorrupt {
                seq: Some(event.seq),
                reason: format!("non-dense seq: expected {} got {}", self.expected_seq, event.seq),
            });
        }
        if event.kind != event.payload.kind() {
            return Err(SimError::TapeCorrupt {
                seq: Some(event.seq),
                reason: "kind/payload mismatch".to_string(),
            });
        }
        if !self.asset_ids.contains(&event.asset_id) {
            return Err(SimError::TapeCorrupt {
                seq: Some(event.seq),
                reason: format!("asset_id {} not in tape's declared set", event.asset_id),
            });
        }
        if matches!(event.payload, Payload::PriceChange(_)) && !self.seen_snapshot.contains(&event.asset_id) {
            return Err(SimError::TapeCorrupt {
                seq: Some(event.seq),
                reason: format!("price_change before first book_snapshot for {}", event.asset_id),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TapeId;
    use crate::tape::recorder::Recorder;
    use crate::tape::schema::PriceLevel;
    use std::str::FromStr;
    use rust_decimal::Decimal;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn round_trips_through_recorder_and_reader() {
        let tmp = std::env::temp_dir().join(format!("simtrader-test-{}", uuid::Uuid::new_v4()));
        let asset: AssetId = "asset-1".into();
        let mut assets = BTreeSet::new();
        assets.insert(asset.clone());

        let mut rec = Recorder::create(&tmp, TapeId("t1".into()), assets).unwrap();
        rec.record_events(
            1000,
            asset.clone(),
            vec![Payload::BookSnapshot {
                asks: vec![PriceLevel { price: d("0.50"), size: d("100") }],
                bids: vec![PriceLevel { price: d("0.48"), size: d("50") }],
                tick_size: d("0.01"),
                hash: "h1".into(),
            }],
        )
        .unwrap();
        rec.record_events(
            1001,
            asset.clone(),
            vec![Payload::PriceChange(vec![])],
        )
        .unwrap();
        rec.close().unwrap();

        let src = TapeSource::open(&tmp).unwrap();
        let events: Vec<_> = src.reader().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);

        // Restartable: reading again from the start yields the same sequence.
        let events2: Vec<_> = src.reader().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(events2.len(), events.len());
        assert_eq!(events2[0].seq, events[0].seq);

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn rejects_price_change_before_snapshot() {
        let tmp = std::env::temp_dir().join(format!("simtrader-test-{}", uuid::Uuid::new_v4()));
        let asset: AssetId = "asset-1".into();
        let mut assets = BTreeSet::new();
        assets.insert(asset.clone());
        let mut rec = Recorder::create(&tmp, TapeId("t1".into()), assets).unwrap();
        rec.record_events(1000, asset, vec![Payload::PriceChange(vec![])]).unwrap();
        rec.close().unwrap();

        let src = TapeSource::open(&tmp).unwrap();
        let result: Result<Vec<_>, _> = src.reader().unwrap().collect();
        assert!(result.is_err());
        std::fs::remove_dir_all(&tmp).ok();
    }
}
