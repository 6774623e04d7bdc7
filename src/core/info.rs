//! Mutable per-run state that survives restarts

use crate::gdf::AdaptiveLossSnapshot;
use serde::{Deserialize, Serialize};

/// Persisted alongside the weight checkpoints. Everything else about a run
/// is either immutable config or reconstructible from the weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunInfo {
    /// Completed optimizer updates across all restarts.
    pub total_steps: u64,
    /// Step at which EMA tracking begins, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_active_from: Option<u64>,
    /// Adaptive loss-weight buckets, present when the run uses them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_loss: Option<AdaptiveLossSnapshot>,
}
