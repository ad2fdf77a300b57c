//! Core error taxonomy (spec.md §7). These are the kinds a strategy, book,
//! broker, or engine boundary can return; `main.rs`/config loading still use
//! `anyhow` the way the teacher's CLI entry does.

use crate::ids::{AssetId, OrderId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SimError {
    /// Fatal to the current run; prevents start or aborts replay.
    #[error("tape corrupt at seq={seq:?}: {reason}")]
    TapeCorrupt { seq: Option<u64>, reason: String },

    /// Downgrades run_quality, counted; event is skipped.
    #[error("feed protocol error at seq={seq}: {reason}")]
    FeedProtocolError { seq: u64, reason: String },

    /// Counted; may drop the offending event.
    #[error("book inconsistency asset={asset_id} seq={seq}: {reason}")]
    BookInconsistency {
        asset_id: AssetId,
        seq: u64,
        reason: String,
    },

    /// Per-order terminal rejection; recovered locally.
    #[error("order validation failed order_id={order_id} reason={reason}")]
    OrderValidationError { order_id: OrderId, reason: String },

    /// Fatal to the current run.
    #[error("portfolio invariant violated: {0}")]
    PortfolioInvariantViolation(String),

    /// Shadow driver stall threshold exceeded.
    #[error("feed timeout after {elapsed_secs}s")]
    FeedTimeout { elapsed_secs: f64 },

    /// Caller-supplied deadline reached; clean halt.
    #[error("run deadline exceeded")]
    DeadlineExceeded,

    /// Per-frame dropped, counted; fatal once over threshold.
    #[error("recorder io error: {0}")]
    RecorderIOError(String),
}

impl SimError {
    /// Whether this error kind should terminate the current run outright
    /// (spec.md §7 propagation policy), as opposed to being counted/recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::TapeCorrupt { .. }
                | SimError::PortfolioInvariantViolation(_)
                | SimError::FeedTimeout { .. }
                | SimError::DeadlineExceeded
        )
    }
}
