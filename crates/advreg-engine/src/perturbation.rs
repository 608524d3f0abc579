//! Adversarial perturbation search over input embeddings.
//!
//! A perturbation tensor with the shape of the embeddings is initialized,
//! then refined by a bounded number of gradient-ascent steps:
//!
//! 1. **Init**: zeros, masked uniform noise (`init_mag`), or masked Gaussian
//!    noise (`noise_var`), projected onto the max-norm ball.
//! 2. **Forward**: `embeds + perturbation` through the classifier, bypassing
//!    the token-embedding lookup.
//! 3. **Objective**: stable KL against the detached clean logits, or the
//!    supervised loss on the perturbed input.
//! 4. **Gradient**: taken with respect to the perturbation only. A non-finite
//!    gradient norm aborts the search.
//! 5. **Update**: normalized ascent step, detach, project.
//!
//! The last iteration stops after step 4, so its perturbation is the one that
//! was just evaluated. Each iteration owns a fresh tracked copy of the
//! perturbation; nothing is mutated in place.

use advreg_core::{AdversarialConfig, NormType, Result, UpdateRule};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::classifier::{Batch, SequenceClassifier};
use crate::divergence::{stable_kl, STABLE_KL_EPSILON};
use crate::normalizer::{sign, GradientNormalizer};

/// Floor on the per-example gradient norm used by the ascent step.
pub const STEP_NORM_FLOOR: f64 = 1e-8;

/// What the ascent maximizes.
#[derive(Debug, Clone, Copy)]
pub enum SearchObjective<'a> {
    /// Unreduced stable KL between perturbed logits and these (detached) clean logits.
    StableKl { clean_logits: &'a Tensor },
    /// The classifier's own supervised loss on the perturbed input.
    Supervised,
    /// Supervised loss divided by the number of ascent steps, so that the
    /// parameter gradients of all steps sum to one averaged update.
    SupervisedAveraged,
}

/// Perturbation produced by a completed search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub perturbation: Tensor,
    /// Number of gradient computations performed.
    pub gradient_evaluations: usize,
    /// Max absolute value of the last effective direction (row-normalized rule only).
    pub effective_linf: Option<f32>,
}

/// Outcome of a search.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Found(SearchResult),
    /// The perturbation gradient norm was NaN or infinite at `step`.
    NonFinite { step: usize },
}

/// Result of a single ascent update.
#[derive(Debug, Clone)]
pub struct AscentUpdate {
    pub perturbation: Tensor,
    pub effective_linf: Option<f32>,
}

/// Runs the ascent loop for one training step.
#[derive(Debug, Clone)]
pub struct PerturbationSearch<'a> {
    config: &'a AdversarialConfig,
    normalizer: GradientNormalizer,
}

impl<'a> PerturbationSearch<'a> {
    pub fn new(config: &'a AdversarialConfig) -> Self {
        let normalizer =
            GradientNormalizer::new(config.norm_type, config.max_norm, config.sentence_level);
        Self { config, normalizer }
    }

    pub fn config(&self) -> &AdversarialConfig {
        self.config
    }

    /// Build the initial perturbation for `embeds` (`[batch, seq_len, hidden]`).
    pub fn initialize(
        &self,
        embeds: &Tensor,
        attention_mask: &Tensor,
        rng: &mut ChaCha8Rng,
    ) -> Result<Tensor> {
        let (batch, seq_len, hidden) = embeds.dims3()?;
        let device = embeds.device();
        let shape = (batch, seq_len, hidden);
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;

        let delta = if self.config.init_mag > 0.0 {
            match self.config.norm_type {
                NormType::L2 => {
                    let noise = uniform(rng, -1.0, 1.0, shape, device)?.broadcast_mul(&mask)?;
                    // Scale each example by init_mag / sqrt(valid_tokens * hidden).
                    let dims = (mask.sum((1, 2))? * hidden as f64)?.maximum(1.0)?;
                    let magnitude = (dims.sqrt()?.recip()? * self.config.init_mag)?;
                    noise.broadcast_mul(&magnitude.reshape((batch, 1, 1))?)?
                }
                NormType::LInf | NormType::L1 => {
                    let mag = self.config.init_mag as f32;
                    uniform(rng, -mag, mag, shape, device)?.broadcast_mul(&mask)?
                }
            }
        } else if self.config.noise_var > 0.0 {
            (gaussian(rng, shape, device)? * self.config.noise_var)?.broadcast_mul(&mask)?
        } else {
            Tensor::zeros(shape, DType::F32, device)?
        };

        self.project(&delta.to_dtype(embeds.dtype())?)
    }

    /// Run the ascent loop from `init`, reading gradients for the perturbation only.
    ///
    /// `embeds` is detached here, so no gradient of the search reaches the
    /// embedding table; the classifier's parameters are never updated.
    pub fn search<M: SequenceClassifier + ?Sized>(
        &self,
        model: &M,
        embeds: &Tensor,
        batch: &Batch,
        objective: SearchObjective<'_>,
        init: Tensor,
    ) -> Result<SearchOutcome> {
        self.search_with(model, &embeds.detach(), batch, objective, init, |_, _| Ok(()))
    }

    /// Ascent loop handing every step's full gradient store to `on_step`.
    ///
    /// `embeds` is used as given: when it is still attached to the embedding
    /// table, each backward pass also produces parameter gradients, which
    /// `on_step` may accumulate. `on_step` receives the step's scalar loss and
    /// is only called for steps whose perturbation gradient is finite.
    pub fn search_with<M, F>(
        &self,
        model: &M,
        embeds: &Tensor,
        batch: &Batch,
        objective: SearchObjective<'_>,
        init: Tensor,
        mut on_step: F,
    ) -> Result<SearchOutcome>
    where
        M: SequenceClassifier + ?Sized,
        F: FnMut(f32, GradStore) -> Result<()>,
    {
        let clean_logits = match objective {
            SearchObjective::StableKl { clean_logits } => Some(clean_logits.detach()),
            SearchObjective::Supervised | SearchObjective::SupervisedAveraged => None,
        };

        let mut delta = init;
        let mut gradient_evaluations = 0usize;
        let mut effective_linf = None;

        for step in 0..self.config.steps {
            let tracked = Var::from_tensor(&delta)?;
            let perturbed = embeds.broadcast_add(tracked.as_tensor())?;
            let output =
                model.forward_embeds(&perturbed, &batch.attention_mask, Some(&batch.labels))?;

            let loss = match (&clean_logits, objective) {
                (Some(clean), _) => stable_kl(&output.logits, clean, STABLE_KL_EPSILON, false)?,
                (None, SearchObjective::SupervisedAveraged) => {
                    (output.require_loss()? / self.config.steps as f64)?
                }
                (None, _) => output.require_loss()?,
            };

            let grads = loss.backward()?;
            gradient_evaluations += 1;
            let grad = match grads.get(tracked.as_tensor()) {
                Some(g) => g.detach(),
                None => delta.zeros_like()?,
            };

            if !is_finite_norm(&grad)? {
                tracing::warn!(step, "non-finite perturbation gradient, aborting search");
                return Ok(SearchOutcome::NonFinite { step });
            }
            on_step(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?, grads)?;

            if step + 1 == self.config.steps {
                break;
            }

            let update = self.ascent_update(&delta, &grad)?;
            delta = update.perturbation;
            effective_linf = update.effective_linf;
            tracing::debug!(
                step,
                perturbation_linf = linf_magnitude(&delta)?,
                "ascent step applied"
            );
        }

        Ok(SearchOutcome::Found(SearchResult {
            perturbation: delta,
            gradient_evaluations,
            effective_linf,
        }))
    }

    /// Apply one ascent step to `delta` along `grad`, then detach and project.
    pub fn ascent_update(&self, delta: &Tensor, grad: &Tensor) -> Result<AscentUpdate> {
        let step_size = self.config.step_size;
        let (next, effective_linf) = match self.config.update_rule {
            UpdateRule::PerExample => {
                let direction = match self.config.norm_type {
                    NormType::L1 => sign(grad)?,
                    norm @ (NormType::L2 | NormType::LInf) => {
                        let denominator = per_example_norm(grad, norm)?.maximum(STEP_NORM_FLOOR)?;
                        grad.broadcast_div(&denominator)?
                    }
                };
                ((delta + (direction * step_size)?)?.detach(), None)
            }
            UpdateRule::RowNormalized => {
                let effective_grad = (grad * step_size)?;
                let stepped = (delta + &effective_grad)?;
                let normalized = self.normalizer.normalize(&stepped, Some(&effective_grad))?;
                let effective_linf = match &normalized.effective {
                    Some(eff) => Some(linf_magnitude(eff)?),
                    None => None,
                };
                (normalized.direction.detach(), effective_linf)
            }
        };

        Ok(AscentUpdate {
            perturbation: self.project(&next)?,
            effective_linf,
        })
    }

    /// Clip `delta` onto the max-norm ball; identity when unconstrained.
    ///
    /// L-inf and L1 clamp elementwise. L2 rescales only the examples whose
    /// norm exceeds the bound, down to exactly the bound.
    pub fn project(&self, delta: &Tensor) -> Result<Tensor> {
        if !self.config.is_bounded() {
            return Ok(delta.clone());
        }
        let bound = self.config.max_norm;
        match self.config.norm_type {
            NormType::LInf | NormType::L1 => Ok(delta.clamp(-bound, bound)?.detach()),
            NormType::L2 => {
                let norms = per_example_norm(delta, NormType::L2)?;
                let exceed = norms.gt(bound)?.to_dtype(delta.dtype())?;
                let shrink = (norms.maximum(1e-12)?.recip()? * bound)?;
                let keep = exceed.affine(-1.0, 1.0)?;
                let reweights = ((shrink * &exceed)? + keep)?;
                Ok(delta.broadcast_mul(&reweights)?.detach())
            }
        }
    }
}

/// Norm of each example flattened, shaped `[batch, 1, ..., 1]` for broadcasting.
pub fn per_example_norm(t: &Tensor, norm_type: NormType) -> Result<Tensor> {
    let flat = t.flatten_from(1)?;
    let norm = match norm_type {
        NormType::L2 => flat.sqr()?.sum_keepdim(1)?.sqrt()?,
        NormType::LInf | NormType::L1 => flat.abs()?.max_keepdim(1)?,
    };
    let mut shape = vec![1usize; t.rank()];
    shape[0] = t.dim(0)?;
    Ok(norm.reshape(shape)?)
}

/// Whether the global L2 norm of `grad` is finite.
pub fn is_finite_norm(grad: &Tensor) -> Result<bool> {
    let norm = grad
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f64>()?;
    Ok(norm.is_finite())
}

/// Max absolute element.
pub fn linf_magnitude(t: &Tensor) -> Result<f32> {
    if t.elem_count() == 0 {
        return Ok(0.0);
    }
    Ok(t
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?)
}

fn uniform(
    rng: &mut ChaCha8Rng,
    low: f32,
    high: f32,
    shape: (usize, usize, usize),
    device: &candle_core::Device,
) -> Result<Tensor> {
    let n = shape.0 * shape.1 * shape.2;
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(low..high)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn gaussian(
    rng: &mut ChaCha8Rng,
    shape: (usize, usize, usize),
    device: &candle_core::Device,
) -> Result<Tensor> {
    let n = shape.0 * shape.1 * shape.2;
    let data: Vec<f32> = (0..n)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
