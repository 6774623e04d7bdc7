//! Execution context passed explicitly to every stage of a run
//!
//! There are no process-wide globals: the device, replica coordinates and
//! the collective-communication backend all travel together through this
//! struct.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::sync::Arc;

/// Cross-replica communication. Implementations must be deterministic with
/// respect to gradient naming: every replica calls with the same key set.
pub trait Collective: Send + Sync {
    /// Average the named gradients across all replicas, in place.
    fn all_reduce_mean(&self, grads: &mut HashMap<String, Tensor>) -> Result<()>;

    /// Block until every replica reaches this point.
    fn barrier(&self) -> Result<()>;
}

/// Single-process backend: both operations are no-ops.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_mean(&self, _grads: &mut HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub rank: usize,
    pub world_size: usize,
    pub collective: Arc<dyn Collective>,
}

impl ExecutionContext {
    pub fn single(device: Device) -> Self {
        Self { device, rank: 0, world_size: 1, collective: Arc::new(SingleProcess) }
    }

    /// Rank 0 owns checkpoint writes and sample output.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}
