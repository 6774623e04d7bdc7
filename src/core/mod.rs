//! Training lifecycle orchestration
//!
//! The driver owns the order of things: extras, models, optimizers,
//! schedulers, data, then the update loop with its checkpoint and sampling
//! cadence. What those things *are* is up to the [`TrainRun`]
//! implementation; the driver never looks inside a model or a loss.

pub mod checkpoint;
pub mod ema;
pub mod grad;
pub mod info;
pub mod lr;
pub mod optim;

pub use checkpoint::CheckpointStore;
pub use ema::EmaTracker;
pub use grad::GradientAccumulator;
pub use info::RunInfo;
pub use lr::{LrSchedule, WarmupConstant};
pub use optim::AdamW;

use anyhow::Result;
use candle_core::Tensor;
use log::info;

use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::data::{Batch, DataSource};

/// Named optimizers for one run.
#[derive(Default)]
pub struct OptimizerSet {
    entries: Vec<(String, AdamW)>,
}

impl OptimizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, optimizer: AdamW) {
        self.entries.push((name.into(), optimizer));
    }

    pub fn get(&self, name: &str) -> Option<&AdamW> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AdamW> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AdamW)> {
        self.entries.iter().map(|(n, o)| (n.as_str(), o))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut AdamW)> {
        self.entries.iter_mut().map(|(n, o)| (n.as_str(), o))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Named learning-rate schedules, keyed like the optimizers they drive.
#[derive(Default)]
pub struct SchedulerSet {
    entries: Vec<(String, Box<dyn LrSchedule>)>,
}

impl SchedulerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, schedule: Box<dyn LrSchedule>) {
        self.entries.push((name.into(), schedule));
    }

    pub fn get(&self, name: &str) -> Option<&dyn LrSchedule> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn LrSchedule)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s.as_ref()))
    }

    fn first_lr(&self, step: u64) -> Option<f64> {
        self.entries.first().map(|(_, s)| s.lr_at(step))
    }
}

/// Result of one forward micro-step.
pub struct ForwardOutput {
    /// Scalar loss value for logging, before gradient-accumulation scaling.
    pub loss: f64,
    /// The tensor to differentiate, already divided by the number of
    /// micro-steps.
    pub loss_adjusted: Tensor,
}

/// One concrete training run, composed explicitly: the driver calls these
/// hooks in a fixed order and owns nothing else.
pub trait TrainRun {
    type Extras;
    type Models;

    fn config(&self) -> &RunConfig;
    fn context(&self) -> &ExecutionContext;
    fn info(&self) -> &RunInfo;
    fn info_mut(&mut self) -> &mut RunInfo;

    fn setup_extras_pre(&mut self) -> Result<Self::Extras>;
    fn setup_models(&mut self, extras: &Self::Extras) -> Result<Self::Models>;
    fn setup_optimizers(&mut self, models: &Self::Models) -> Result<OptimizerSet>;
    fn setup_schedulers(&mut self, optimizers: &OptimizerSet) -> Result<SchedulerSet>;
    fn setup_data(&mut self, extras: &Self::Extras) -> Result<Box<dyn DataSource>>;

    fn forward_pass(
        &mut self,
        batch: &Batch,
        extras: &mut Self::Extras,
        models: &Self::Models,
    ) -> Result<ForwardOutput>;

    /// Backpropagate one micro-step. With `update = false` gradients only
    /// accumulate locally; with `update = true` they are synced, clipped and
    /// applied, counters advance and the EMA shadow moves. Returns the
    /// pre-clip global gradient norm on update steps.
    fn backward_pass(
        &mut self,
        update: bool,
        output: ForwardOutput,
        models: &Self::Models,
        optimizers: &mut OptimizerSet,
        schedulers: &SchedulerSet,
    ) -> Result<Option<f64>>;

    fn checkpoint(
        &mut self,
        extras: &Self::Extras,
        models: &Self::Models,
        optimizers: &OptimizerSet,
    ) -> Result<()>;

    fn sample_eval(&mut self, extras: &mut Self::Extras, models: &Self::Models) -> Result<()>;
}

/// Drive a run from its current state to `config.updates`.
pub fn run<T: TrainRun>(run: &mut T) -> Result<()> {
    let config = run.config().clone();
    let ctx = run.context().clone();
    info!(
        "Starting run '{}' (rank {}/{}, device {:?})",
        config.experiment_id, ctx.rank, ctx.world_size, ctx.device
    );

    let mut extras = run.setup_extras_pre()?;
    let models = run.setup_models(&extras)?;
    let mut optimizers = run.setup_optimizers(&models)?;
    let schedulers = run.setup_schedulers(&optimizers)?;
    let mut data = run.setup_data(&extras)?;

    let start = run.info().total_steps;
    if start >= config.updates {
        info!("Run already at {} of {} updates, nothing to do", start, config.updates);
        return Ok(());
    }
    info!("Training from update {} to {}", start, config.updates);

    while run.info().total_steps < config.updates {
        let mut loss = 0.0;
        let mut grad_norm = None;
        for micro in 0..config.grad_accum_steps {
            let batch = data.next_batch()?;
            let output = run.forward_pass(&batch, &mut extras, &models)?;
            loss = output.loss;
            let update_now = micro + 1 == config.grad_accum_steps;
            grad_norm = run.backward_pass(update_now, output, &models, &mut optimizers, &schedulers)?;
        }

        let total = run.info().total_steps;
        if total % 10 == 0 || total == config.updates {
            let lr = schedulers.first_lr(total.saturating_sub(1)).unwrap_or(config.lr);
            match grad_norm {
                Some(norm) => info!(
                    "Update {}/{}: loss = {:.4}, grad_norm = {:.4}, lr = {:.3e}",
                    total, config.updates, loss, norm, lr
                ),
                None => info!("Update {}/{}: loss = {:.4}, lr = {:.3e}", total, config.updates, loss, lr),
            }
        }
        if config.save_every > 0 && total % config.save_every == 0 && total < config.updates {
            run.checkpoint(&extras, &models, &optimizers)?;
        }
        if config.sample_every > 0 && total % config.sample_every == 0 {
            run.sample_eval(&mut extras, &models)?;
        }
    }

    run.checkpoint(&extras, &models, &optimizers)?;
    info!("Run '{}' complete at {} updates", config.experiment_id, run.info().total_steps);
    Ok(())
}
