//! Adversarial training strategies.
//!
//! Each strategy turns one batch into either a differentiable objective (the
//! orchestrator back-propagates it once), a set of parameter gradients that
//! were already accumulated during the search, or a skip signal when the
//! perturbation gradient went non-finite.
//!
//! | Strategy | Search objective | Consistency loss | Parameter gradients |
//! |----------|------------------|------------------|---------------------|
//! | `smart`  | stable KL vs clean logits | symmetric KL or JS | one backward of `task + alpha * consistency` |
//! | `vat`    | supervised loss | stable KL | one backward of `task + alpha * consistency` |
//! | `freelb` | supervised loss / steps | none | summed over every ascent step |

use advreg_core::{AdversarialConfig, Result, StrategyKind};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use rand_chacha::ChaCha8Rng;

use crate::classifier::{Batch, SequenceClassifier};
use crate::divergence::{stable_kl, DivergenceCriterion, STABLE_KL_EPSILON};
use crate::perturbation::{
    linf_magnitude, PerturbationSearch, SearchObjective, SearchOutcome, SearchResult,
};

/// Scalar diagnostics of one training step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepStats {
    pub task_loss: f32,
    /// Weighted consistency loss (already multiplied by `alpha`).
    pub adversarial_loss: f32,
    pub total_loss: f32,
    /// Max absolute element of the perturbation used in the final forward.
    pub perturbation_linf: f32,
    pub gradient_evaluations: usize,
    pub effective_linf: Option<f32>,
}

/// What a strategy hands back to the orchestrator.
#[derive(Debug)]
pub enum AdversarialOutcome {
    /// Loss still attached to the parameters; the orchestrator runs backward.
    Objective { total: Tensor, stats: StepStats },
    /// Parameter gradients already summed over the search.
    Accumulated { grads: GradStore, stats: StepStats },
    /// The perturbation gradient was non-finite at `step`; nothing to apply.
    Skipped { step: usize },
}

/// One way of producing the adversarial training signal for a batch.
pub trait AdversarialStrategy {
    fn kind(&self) -> StrategyKind;

    /// Compute the outcome for `batch` without touching any parameter.
    fn compute(
        &self,
        model: &dyn SequenceClassifier,
        batch: &Batch,
        rng: &mut ChaCha8Rng,
    ) -> Result<AdversarialOutcome>;
}

/// Build the strategy selected by `config.strategy`.
pub fn build_strategy(config: &AdversarialConfig) -> Box<dyn AdversarialStrategy> {
    match config.strategy {
        StrategyKind::Smart => Box::new(SmartStrategy::new(config.clone())),
        StrategyKind::Virtual => Box::new(VirtualStrategy::new(config.clone())),
        StrategyKind::FreeLb => Box::new(FreeLbStrategy::new(config.clone())),
    }
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Shared tail of the search-then-combine strategies: final perturbed
/// forward, consistency loss, combined objective.
fn combine(
    model: &dyn SequenceClassifier,
    batch: &Batch,
    embeds: &Tensor,
    clean_logits: &Tensor,
    task_loss: Tensor,
    result: SearchResult,
    consistency: impl FnOnce(&Tensor, &Tensor) -> Result<Tensor>,
) -> Result<AdversarialOutcome> {
    let perturbed_embeds = embeds.broadcast_add(&result.perturbation)?;
    let perturbed = model.forward_embeds(&perturbed_embeds, &batch.attention_mask, None)?;
    let adversarial = consistency(&perturbed.logits, clean_logits)?;
    let total = (&task_loss + &adversarial)?;

    let stats = StepStats {
        task_loss: scalar(&task_loss)?,
        adversarial_loss: scalar(&adversarial)?,
        total_loss: scalar(&total)?,
        perturbation_linf: linf_magnitude(&result.perturbation)?,
        gradient_evaluations: result.gradient_evaluations,
        effective_linf: result.effective_linf,
    };
    Ok(AdversarialOutcome::Objective { total, stats })
}

// ---------------------------------------------------------------------------
// smart
// ---------------------------------------------------------------------------

/// Stable-KL-driven search, symmetric or JS consistency loss.
#[derive(Debug, Clone)]
pub struct SmartStrategy {
    config: AdversarialConfig,
    criterion: DivergenceCriterion,
}

impl SmartStrategy {
    pub fn new(config: AdversarialConfig) -> Self {
        let criterion = DivergenceCriterion::new(config.divergence, config.alpha);
        Self { config, criterion }
    }
}

impl AdversarialStrategy for SmartStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Smart
    }

    fn compute(
        &self,
        model: &dyn SequenceClassifier,
        batch: &Batch,
        rng: &mut ChaCha8Rng,
    ) -> Result<AdversarialOutcome> {
        let embeds = model.embed(&batch.input_ids)?;
        let clean = model.forward_embeds(&embeds, &batch.attention_mask, Some(&batch.labels))?;
        let task_loss = clean.require_loss()?;

        let search = PerturbationSearch::new(&self.config);
        let init = search.initialize(&embeds, &batch.attention_mask, rng)?;
        let objective = SearchObjective::StableKl {
            clean_logits: &clean.logits,
        };
        let result = match search.search(model, &embeds, batch, objective, init)? {
            SearchOutcome::Found(result) => result,
            SearchOutcome::NonFinite { step } => return Ok(AdversarialOutcome::Skipped { step }),
        };

        combine(
            model,
            batch,
            &embeds,
            &clean.logits,
            task_loss,
            result,
            |perturbed, clean| self.criterion.forward(perturbed, clean),
        )
    }
}

// ---------------------------------------------------------------------------
// vat
// ---------------------------------------------------------------------------

/// Supervised-loss-driven search, stable KL consistency loss.
#[derive(Debug, Clone)]
pub struct VirtualStrategy {
    config: AdversarialConfig,
}

impl VirtualStrategy {
    pub fn new(config: AdversarialConfig) -> Self {
        Self { config }
    }
}

impl AdversarialStrategy for VirtualStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Virtual
    }

    fn compute(
        &self,
        model: &dyn SequenceClassifier,
        batch: &Batch,
        rng: &mut ChaCha8Rng,
    ) -> Result<AdversarialOutcome> {
        let embeds = model.embed(&batch.input_ids)?;
        let clean = model.forward_embeds(&embeds, &batch.attention_mask, Some(&batch.labels))?;
        let task_loss = clean.require_loss()?;

        let search = PerturbationSearch::new(&self.config);
        let init = search.initialize(&embeds, &batch.attention_mask, rng)?;
        let result =
            match search.search(model, &embeds, batch, SearchObjective::Supervised, init)? {
                SearchOutcome::Found(result) => result,
                SearchOutcome::NonFinite { step } => {
                    return Ok(AdversarialOutcome::Skipped { step })
                }
            };

        let alpha = self.config.alpha;
        combine(
            model,
            batch,
            &embeds,
            &clean.logits,
            task_loss,
            result,
            |perturbed, clean| {
                let kl = stable_kl(perturbed, &clean.detach(), STABLE_KL_EPSILON, false)?;
                Ok((kl * alpha)?)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// freelb
// ---------------------------------------------------------------------------

/// Accumulate-through-search: every ascent step contributes parameter gradients.
#[derive(Debug, Clone)]
pub struct FreeLbStrategy {
    config: AdversarialConfig,
}

impl FreeLbStrategy {
    pub fn new(config: AdversarialConfig) -> Self {
        Self { config }
    }
}

impl AdversarialStrategy for FreeLbStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FreeLb
    }

    fn compute(
        &self,
        model: &dyn SequenceClassifier,
        batch: &Batch,
        rng: &mut ChaCha8Rng,
    ) -> Result<AdversarialOutcome> {
        // Kept attached so the embedding table is trained too.
        let embeds = model.embed(&batch.input_ids)?;
        let params = model.parameters();

        let search = PerturbationSearch::new(&self.config);
        let init = search.initialize(&embeds.detach(), &batch.attention_mask, rng)?;

        let mut accumulated: Option<GradStore> = None;
        let mut losses: Vec<f32> = Vec::with_capacity(self.config.steps);
        let outcome = search.search_with(
            model,
            &embeds,
            batch,
            SearchObjective::SupervisedAveraged,
            init,
            |loss, grads| {
                losses.push(loss);
                match accumulated.as_mut() {
                    None => accumulated = Some(grads),
                    Some(acc) => {
                        for var in &params {
                            let Some(grad) = grads.get(var.as_tensor()) else {
                                continue;
                            };
                            let sum = match acc.get(var.as_tensor()) {
                                Some(prev) => (prev + grad)?,
                                None => grad.clone(),
                            };
                            acc.insert(var.as_tensor(), sum);
                        }
                    }
                }
                Ok(())
            },
        )?;

        let result = match outcome {
            SearchOutcome::Found(result) => result,
            SearchOutcome::NonFinite { step } => return Ok(AdversarialOutcome::Skipped { step }),
        };
        let Some(grads) = accumulated else {
            return Ok(AdversarialOutcome::Skipped { step: 0 });
        };

        // Step losses are already divided by `steps`; undo that for reporting.
        let steps = self.config.steps as f32;
        let first = losses.first().copied().unwrap_or_default() * steps;
        let last = losses.last().copied().unwrap_or_default() * steps;
        let stats = StepStats {
            task_loss: first,
            adversarial_loss: last,
            total_loss: losses.iter().sum(),
            perturbation_linf: linf_magnitude(&result.perturbation)?,
            gradient_evaluations: result.gradient_evaluations,
            effective_linf: result.effective_linf,
        };
        Ok(AdversarialOutcome::Accumulated { grads, stats })
    }
}
