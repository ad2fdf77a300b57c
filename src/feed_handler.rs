//! Live Polymarket CLOB WS feed, adapted into the normalized event shape
//! the engine consumes (spec.md §4.7). Market discovery is out of scope
//! here: the caller hands this a fixed, already-chosen asset_id list.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tokio::sync::mpsc::Sender;

use crate::config::Settings;
use crate::error::SimError;
use crate::ids::AssetId;
use crate::tape::schema::{ControlSubkind, Event, Payload, PriceChangeEntry, PriceLevel, Side};
use crate::utils::now_ms;

use polymarket_hft::client::polymarket::clob::ws::{ClobWsClient, Side as WsSide, WsMessage};

fn convert_side(side: WsSide) -> Side {
    match side {
        WsSide::Buy => Side::Buy,
        WsSide::Sell => Side::Sell,
    }
}

fn ws_base_url(ws_url: &str) -> String {
    let s = ws_url.trim();
    if let Some((base, _)) = s.split_once("/ws/") {
        base.to_string()
    } else {
        s.trim_end_matches('/').to_string()
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s.trim()).ok()
}

fn parse_levels(levels: &[polymarket_hft::client::polymarket::clob::ws::WsPriceLevel]) -> Vec<PriceLevel> {
    levels
        .iter()
        .filter_map(|lvl| {
            let price = parse_decimal(&lvl.price)?;
            let size = parse_decimal(&lvl.size)?;
            Some(PriceLevel { price, size })
        })
        .collect()
}

/// Connects, subscribes to `asset_ids`, and streams normalized events into
/// `tx` until the process is told to stop or reconnection is exhausted.
/// Reconnects are reported as `control:ws_reconnect` events so downstream
/// consumers (and any tee'd tape recording) see the discontinuity.
pub async fn run_feed(
    settings: Settings,
    asset_ids: Vec<AssetId>,
    tx: Sender<Result<Event, SimError>>,
) -> Result<()> {
    let mut ws = ClobWsClient::builder().base_url(ws_base_url(&settings.clob_ws_url)).build();
    let tokens: Vec<String> = asset_ids.iter().map(|a| a.as_str().to_string()).collect();

    ws.subscribe_market(tokens).await.map_err(|e| anyhow!("ws.subscribe_market failed: {e}"))?;

    let mut seq: u64 = 0;
    let mut last_seen_tick_size: HashMap<AssetId, Decimal> = HashMap::new();
    let mut last_message_at = std::time::Instant::now();
    let mut keepalive_sent = false;

    loop {
        let stall_elapsed = last_message_at.elapsed();
        if stall_elapsed > Duration::from_secs(settings.max_ws_stall_secs) {
            let err = SimError::FeedTimeout { elapsed_secs: stall_elapsed.as_secs_f64() };
            let _ = tx.send(Err(err)).await;
            return Ok(());
        }
        // Softer threshold before the hard stall timeout above: tell
        // downstream consumers the feed is quiet but not yet dead
        // (spec.md §8 scenario 6), once per stall episode.
        if !keepalive_sent && stall_elapsed > Duration::from_secs(settings.keepalive_after_secs) {
            keepalive_sent = true;
            let keepalive = Event::new(seq, now_ms(), asset_ids[0].clone(), Payload::Control { subkind: ControlSubkind::Keepalive });
            seq += 1;
            if tx.send(Ok(keepalive)).await.is_err() {
                return Ok(());
            }
        }

        let msg = tokio::select! {
            msg = ws.next_message() => msg,
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
        };

        let Some(msg) = msg else {
            log::warn!("shadow.feed.disconnected, reconnecting");
            let recon = Event::new(seq, now_ms(), asset_ids[0].clone(), Payload::Control { subkind: ControlSubkind::WsReconnect });
            seq += 1;
            if tx.send(Ok(recon)).await.is_err() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        };
        last_message_at = std::time::Instant::now();
        keepalive_sent = false;

        let events = match msg {
            WsMessage::Book(b) => {
                let Some(asset_id) = asset_ids.iter().find(|a| a.as_str() == b.asset_id.trim()).cloned() else {
                    continue;
                };
                let tick_size = last_seen_tick_size.get(&asset_id).copied().unwrap_or(settings.default_tick_size);
                let payload = Payload::BookSnapshot {
                    bids: parse_levels(&b.bids),
                    asks: parse_levels(&b.asks),
                    tick_size,
                    hash: b.hash.clone(),
                };
                vec![(asset_id, payload)]
            }
            WsMessage::LastTradePrice(t) => {
                let Some(asset_id) = asset_ids.iter().find(|a| a.as_str() == t.asset_id.trim()).cloned() else {
                    continue;
                };
                let (Some(price), Some(size)) = (parse_decimal(&t.price), parse_decimal(&t.size)) else {
                    continue;
                };
                let side = convert_side(t.side);
                let payload = Payload::LastTradePrice { price, size, side, trade_id: t.timestamp.clone() };
                vec![(asset_id, payload)]
            }
            WsMessage::PriceChange(pc) => {
                let mut by_asset: std::collections::BTreeMap<AssetId, Vec<PriceChangeEntry>> = std::collections::BTreeMap::new();
                for change in &pc.price_changes {
                    let Some(asset_id) = asset_ids.iter().find(|a| a.as_str() == change.asset_id.trim()).cloned() else {
                        continue;
                    };
                    let (Some(price), Some(size)) = (parse_decimal(&change.price), parse_decimal(&change.size)) else {
                        continue;
                    };
                    by_asset.entry(asset_id).or_default().push(PriceChangeEntry {
                        side: convert_side(change.side),
                        price,
                        size,
                    });
                }
                by_asset
                    .into_iter()
                    .map(|(asset_id, entries)| (asset_id, Payload::PriceChange(entries)))
                    .collect()
            }
            WsMessage::TickSizeChange(t) => {
                let Some(asset_id) = asset_ids.iter().find(|a| a.as_str() == t.asset_id.trim()).cloned() else {
                    continue;
                };
                let Some(tick_size) = parse_decimal(&t.new_tick_size) else {
                    continue;
                };
                last_seen_tick_size.insert(asset_id.clone(), tick_size);
                vec![(asset_id, Payload::TickSizeChange { tick_size })]
            }
            _ => continue,
        };

        for (asset_id, payload) in events {
            let event = Event::new(seq, now_ms(), asset_id, payload);
            seq += 1;
            if tx.send(Ok(event)).await.is_err() {
                return Ok(());
            }
        }
    }
}
