//! Exponential moving average of model weights

use anyhow::{bail, Result};
use candle_core::Var;
use std::collections::HashMap;

/// Maintains a shadow copy of the live weights. The shadow is initialized
/// from the live weights at setup and stays frozen until the run passes
/// `start_step`; from then on every update folds the live weights in with
/// shadow = decay * shadow + (1 - decay) * live.
#[derive(Debug, Clone)]
pub struct EmaTracker {
    decay: f64,
    start_step: u64,
}

impl EmaTracker {
    pub fn new(decay: f64, start_step: u64) -> Self {
        Self { decay, start_step }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn is_active(&self, total_steps: u64) -> bool {
        total_steps >= self.start_step
    }

    /// Fold the live weights into the shadow. Returns false (and does
    /// nothing) before the activation step.
    pub fn update(
        &self,
        live: &HashMap<String, Var>,
        shadow: &HashMap<String, Var>,
        total_steps: u64,
    ) -> Result<bool> {
        if !self.is_active(total_steps) {
            return Ok(false);
        }
        for (name, live_var) in live {
            let Some(shadow_var) = shadow.get(name) else {
                bail!("EMA shadow is missing parameter '{}'", name);
            };
            let blended = ((shadow_var.as_tensor() * self.decay)?
                + (live_var.as_tensor() * (1.0 - self.decay))?)?;
            shadow_var.set(&blended)?;
        }
        Ok(true)
    }

    /// Overwrite the shadow with the live weights, used once at setup when
    /// no stored shadow exists yet.
    pub fn initialize(&self, live: &HashMap<String, Var>, shadow: &HashMap<String, Var>) -> Result<()> {
        for (name, live_var) in live {
            let Some(shadow_var) = shadow.get(name) else {
                bail!("EMA shadow is missing parameter '{}'", name);
            };
            shadow_var.set(live_var.as_tensor())?;
        }
        Ok(())
    }
}
