mod artifacts;
mod book;
mod broker;
mod config;
mod engine;
mod error;
mod feed_handler;
mod ids;
mod portfolio;
mod shadow;
mod strategy;
mod tape;
mod utils;

use anyhow::{anyhow, Result};
use clap::Parser;
use rust_decimal::Decimal;

use crate::artifacts::{ArtifactSinks, RunSource};
use crate::broker::BrokerConfig;
use crate::config::{MarkMethod as ConfigMarkMethod, RealismMode, Settings};
use crate::engine::{Engine, EngineConfig};
use crate::ids::{AssetId, RunId};
use crate::portfolio::{MarkMethod, PortfolioConfig};
use crate::strategy::complement_arb::{ComplementArbConfig, ComplementArbStrategy};
use crate::strategy::replay_trades::{ReplayTradesConfig, ReplayTradesStrategy};
use crate::strategy::Strategy;
use crate::tape::TapeSource;

/// Default age, in events, a resting leg waits for its complement before
/// the strategy unwinds it. Independent of `TIF_SEQ_LIMIT`, which governs
/// order-level expiration inside the broker rather than strategy-level
/// unwind timing.
const DEFAULT_UNWIND_WAIT_SEQ: u64 = 20;

#[derive(Debug, Parser)]
#[command(name = "simtrader", version)]
struct Cli {
    /// Override RUN_MODE (replay|shadow)
    #[arg(long)]
    mode: Option<String>,
}

fn build_strategy(settings: &Settings) -> Result<Box<dyn Strategy + Send>> {
    match settings.strategy.as_str() {
        "binary-complement-arb" => {
            if settings.asset_ids.len() < 2 {
                return Err(anyhow!("binary-complement-arb requires two ASSET_IDS (yes,no)"));
            }
            Ok(Box::new(ComplementArbStrategy::new(ComplementArbConfig {
                yes_asset: AssetId::from(settings.asset_ids[0].clone()),
                no_asset: AssetId::from(settings.asset_ids[1].clone()),
                fee_threshold: Decimal::new(1, 2),
                max_leg_size: Decimal::new(100, 0),
                unwind_wait_seq: DEFAULT_UNWIND_WAIT_SEQ,
            })))
        }
        "replay-trades" => {
            if settings.asset_ids.is_empty() {
                return Err(anyhow!("replay-trades requires at least one ASSET_IDS entry"));
            }
            Ok(Box::new(ReplayTradesStrategy::new(ReplayTradesConfig {
                asset_id: AssetId::from(settings.asset_ids[0].clone()),
                size_scale: Decimal::new(1, 1),
                max_order_size: Decimal::new(100, 0),
            })))
        }
        other => Err(anyhow!("unknown strategy {other}")),
    }
}

fn engine_config(settings: &Settings, run_id: RunId, source: RunSource) -> EngineConfig {
    EngineConfig {
        run_id,
        source,
        starting_cash: settings.starting_cash,
        broker: BrokerConfig {
            min_order_notional: settings.min_order_notional,
            cancel_latency_seq: settings.cancel_latency_seq,
            strict_realism: matches!(settings.realism_mode, RealismMode::Strict),
            tif_seq_limit: settings.tif_seq_limit,
        },
        portfolio: PortfolioConfig {
            fee_rate: settings.fee_rate,
            fee_on_notional: settings.fee_on_notional,
            mark_method: match settings.mark_method {
                ConfigMarkMethod::BidForLong => MarkMethod::BidForLong,
                ConfigMarkMethod::Midpoint => MarkMethod::Midpoint,
            },
        },
        default_tick_size: settings.default_tick_size,
        max_counted_errors: settings.max_counted_errors,
        primary_asset_id: settings.primary_asset_id.clone().map(AssetId::from),
        cancel_on_gap: settings.cancel_on_gap,
        realism_mode: match settings.realism_mode {
            RealismMode::Strict => "strict".to_string(),
            RealismMode::Relaxed => "relaxed".to_string(),
        },
        tracked_asset_ids: settings.asset_ids.iter().map(|s| AssetId::from(s.clone())).collect(),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(m) = cli.mode {
        settings.run_mode = m.to_lowercase();
    }

    log::info!("app.start run_mode={} strategy={}", settings.run_mode, settings.strategy);

    let run_id = RunId(uuid::Uuid::new_v4().to_string());
    let run_dir = format!("{}/{}", settings.run_output_dir, run_id);
    let strategy = build_strategy(&settings)?;

    match settings.run_mode.as_str() {
        "replay" => {
            let tape_dir = settings.tape_dir.clone().ok_or_else(|| anyhow!("TAPE_DIR required"))?;
            let tape_source = TapeSource::open(&tape_dir)?;
            let source = RunSource::Tape { tape_id: tape_source.meta.tape_id.clone(), tape_dir };
            let reader = tape_source.reader()?;
            let sinks = ArtifactSinks::create(&run_dir)?;
            let cfg = engine_config(&settings, run_id, source);
            let engine = Engine::new(cfg, strategy, sinks);
            engine.run(reader)?;
        }
        "shadow" => {
            let sinks = ArtifactSinks::create(&run_dir)?;
            let source = RunSource::Shadow { session_id: run_id.to_string() };
            let cfg = engine_config(&settings, run_id, source);
            shadow::run(settings, cfg, strategy, sinks).await?;
        }
        other => return Err(anyhow!("unknown run_mode {other}")),
    }

    Ok(())
}
