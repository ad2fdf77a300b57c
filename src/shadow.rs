//! Shadow driver (spec.md §4.7): runs the engine against a live feed
//! instead of a recorded tape. The feed runs on the tokio runtime; the
//! engine's deterministic loop runs on a dedicated blocking thread,
//! bridged by a bounded channel so a slow engine applies backpressure to
//! the reader rather than the other way around.

use anyhow::Result;
use tokio::sync::mpsc::Receiver;

use crate::artifacts::ArtifactSinks;
use crate::config::Settings;
use crate::engine::{Engine, EngineConfig};
use crate::error::SimError;
use crate::feed_handler;
use crate::ids::AssetId;
use crate::strategy::Strategy;
use crate::tape::schema::Event;

/// Adapts a tokio mpsc receiver into the blocking `Iterator` the engine's
/// single-threaded loop expects.
struct ChannelEvents {
    rx: Receiver<Result<Event, SimError>>,
}

impl Iterator for ChannelEvents {
    type Item = Result<Event, SimError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}

pub async fn run(settings: Settings, engine_cfg: EngineConfig, strategy: Box<dyn Strategy + Send>, sinks: ArtifactSinks) -> Result<()> {
    let asset_ids: Vec<AssetId> = settings.asset_ids.iter().map(|s| AssetId::from(s.clone())).collect();
    let (tx, rx) = tokio::sync::mpsc::channel(1024);

    let feed_settings = settings.clone();
    let feed_assets = asset_ids.clone();
    let feed_handle = tokio::spawn(async move {
        if let Err(e) = feed_handler::run_feed(feed_settings, feed_assets, tx).await {
            log::error!("shadow.feed.fatal {}", e);
        }
    });

    let engine = Engine::new(engine_cfg, strategy, sinks);
    let engine_handle = tokio::task::spawn_blocking(move || engine.run(ChannelEvents { rx }));

    tokio::select! {
        result = engine_handle => {
            feed_handle.abort();
            result?
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shadow.shutdown ctrl_c received");
            feed_handle.abort();
            Ok(())
        }
    }
}
