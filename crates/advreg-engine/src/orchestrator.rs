//! Training step orchestration.
//!
//! [`TrainingStep`] owns the strategy, the optimizer, the learning-rate
//! schedule and the random generator used for perturbation init. Parameters
//! change at exactly one point per step: the optimizer step after the
//! strategy has produced its objective or its accumulated gradients. A
//! skipped step reaches neither the optimizer nor the schedule.
//!
//! Gradients are never reset explicitly: every backward pass builds a fresh
//! gradient store, so nothing carries over between steps.

use std::fmt;

use advreg_core::{AdvRegError, Result, TrainingConfig};
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::classifier::{Batch, SequenceClassifier};
use crate::schedule::LinearSchedule;
use crate::strategy::{AdversarialOutcome, AdversarialStrategy, StepStats};

/// Result of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied(StepStats),
    /// Non-finite perturbation gradient at ascent step `step`; no update made.
    Skipped { step: usize },
}

/// Aggregate of one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochSummary {
    pub applied: usize,
    pub skipped: usize,
    /// Means over applied steps only.
    pub mean_task_loss: f64,
    pub mean_adversarial_loss: f64,
    pub mean_total_loss: f64,
    pub max_perturbation_linf: f32,
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss={:.4} task={:.4} adv={:.4} steps={} skipped={} max|δ|={:.2e}",
            self.mean_total_loss,
            self.mean_task_loss,
            self.mean_adversarial_loss,
            self.applied,
            self.skipped,
            self.max_perturbation_linf,
        )
    }
}

/// AdamW over `params` with the configured rate and weight decay.
pub fn build_optimizer(params: Vec<Var>, config: &TrainingConfig) -> Result<AdamW> {
    let optimizer = AdamW::new(
        params,
        ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )
    .map_err(|e| AdvRegError::Config(format!("Failed to create optimizer: {e}")))?;
    Ok(optimizer)
}

/// Drives adversarial training steps over a stream of batches.
pub struct TrainingStep<O: Optimizer> {
    strategy: Box<dyn AdversarialStrategy>,
    optimizer: O,
    schedule: LinearSchedule,
    rng: ChaCha8Rng,
    progress: usize,
    log_every: usize,
}

impl<O: Optimizer> TrainingStep<O> {
    pub fn new(
        strategy: Box<dyn AdversarialStrategy>,
        mut optimizer: O,
        schedule: LinearSchedule,
        seed: u64,
    ) -> Self {
        optimizer.set_learning_rate(schedule.current_lr());
        Self {
            strategy,
            optimizer,
            schedule,
            rng: ChaCha8Rng::seed_from_u64(seed),
            progress: 0,
            log_every: 0,
        }
    }

    /// Emit an `info` progress line every `every` steps (0 disables).
    pub fn with_log_every(mut self, every: usize) -> Self {
        self.log_every = every;
        self
    }

    /// Steps attempted so far, skipped ones included.
    pub fn progress(&self) -> usize {
        self.progress
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn strategy(&self) -> &dyn AdversarialStrategy {
        self.strategy.as_ref()
    }

    /// Run one adversarial training step on `batch`.
    pub fn step(&mut self, model: &dyn SequenceClassifier, batch: &Batch) -> Result<StepOutcome> {
        let outcome = self.strategy.compute(model, batch, &mut self.rng)?;
        self.progress += 1;

        let stats = match outcome {
            AdversarialOutcome::Skipped { step } => {
                tracing::warn!(
                    progress = self.progress,
                    ascent_step = step,
                    "non-finite perturbation gradient, skipping batch"
                );
                return Ok(StepOutcome::Skipped { step });
            }
            AdversarialOutcome::Objective { total, stats } => {
                self.optimizer.backward_step(&total)?;
                stats
            }
            AdversarialOutcome::Accumulated { grads, stats } => {
                self.optimizer.step(&grads)?;
                stats
            }
        };
        self.schedule.advance(&mut self.optimizer);

        tracing::debug!(
            progress = self.progress,
            task_loss = stats.task_loss,
            adversarial_loss = stats.adversarial_loss,
            total_loss = stats.total_loss,
            perturbation_linf = stats.perturbation_linf,
            "training step applied"
        );
        if self.log_every > 0 && self.progress % self.log_every == 0 {
            tracing::info!(
                progress = self.progress,
                loss = stats.total_loss,
                lr = self.optimizer.learning_rate(),
                "training progress"
            );
        }
        Ok(StepOutcome::Applied(stats))
    }

    /// Run [`TrainingStep::step`] over every batch of one epoch.
    pub fn run_epoch<I>(&mut self, model: &dyn SequenceClassifier, batches: I) -> Result<EpochSummary>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut summary = EpochSummary::default();
        let (mut task, mut adversarial, mut total) = (0.0f64, 0.0f64, 0.0f64);

        for batch in batches {
            match self.step(model, &batch?)? {
                StepOutcome::Applied(stats) => {
                    summary.applied += 1;
                    task += stats.task_loss as f64;
                    adversarial += stats.adversarial_loss as f64;
                    total += stats.total_loss as f64;
                    summary.max_perturbation_linf =
                        summary.max_perturbation_linf.max(stats.perturbation_linf);
                }
                StepOutcome::Skipped { .. } => summary.skipped += 1,
            }
        }

        if summary.applied > 0 {
            let n = summary.applied as f64;
            summary.mean_task_loss = task / n;
            summary.mean_adversarial_loss = adversarial / n;
            summary.mean_total_loss = total / n;
        }
        Ok(summary)
    }
}
