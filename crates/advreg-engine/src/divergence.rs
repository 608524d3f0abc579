//! Distribution distances between two logit tensors.
//!
//! [`stable_kl`] is the per-ascent-step objective of the perturbation search.
//! [`DivergenceCriterion`] is the consistency loss added to the task loss once
//! the search has produced its final perturbation.
//!
//! Which side of each term is detached decides which forward pass receives the
//! adversarial gradient signal, so every `detach` below is load-bearing.

use advreg_core::{DivergenceKind, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

/// Default smoothing constant of [`stable_kl`].
pub const STABLE_KL_EPSILON: f64 = 1e-6;

/// Flatten `(..., classes)` logits into `(rows, classes)` as f32.
fn flatten_logits(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    if logits.rank() > 2 {
        Ok(logits.flatten_to(D::Minus2)?)
    } else {
        Ok(logits)
    }
}

/// `-log(1/(p+eps) - 1 + eps)`, a logit-of-probability surrogate that stays
/// finite as `p` approaches 0 or 1.
fn logit_surrogate(probs: &Tensor, epsilon: f64) -> Result<Tensor> {
    let inv = (probs + epsilon)?.recip()?;
    Ok((inv - (1.0 - epsilon))?.log()?.neg()?)
}

/// Numerically stabilized one-directional KL between `logit` and `target`.
///
/// Gradients flow only through the probabilities of `logit`; both surrogate
/// offsets are evaluated on detached copies. With `reduce` the sum is divided
/// by the number of rows, otherwise the raw sum is returned so that a caller
/// who normalizes later does not normalize twice.
pub fn stable_kl(logit: &Tensor, target: &Tensor, epsilon: f64, reduce: bool) -> Result<Tensor> {
    let logit = flatten_logits(logit)?;
    let target = flatten_logits(target)?;
    let rows = logit.dim(0)?;

    let p = log_softmax(&logit, D::Minus1)?.exp()?;
    let y = log_softmax(&target.detach(), D::Minus1)?.exp()?;
    let rp = logit_surrogate(&p.detach(), epsilon)?;
    let ry = logit_surrogate(&y, epsilon)?;

    let kl = ((&p * (rp - ry)?)? * 2.0)?.sum_all()?;
    if reduce && rows > 0 {
        Ok((kl / rows as f64)?)
    } else {
        Ok(kl)
    }
}

/// `kl_div(input_log, target)` with batch-mean reduction:
/// `sum(target * (log target - input_log)) / batch`.
fn kl_div_batchmean(input_log: &Tensor, target: &Tensor, target_log: &Tensor) -> Result<Tensor> {
    let batch = input_log.dim(0)?.max(1);
    let pointwise = (target * (target_log - input_log)?)?;
    Ok((pointwise.sum_all()? / batch as f64)?)
}

/// Consistency loss between clean and perturbed logits, weighted by `alpha`.
#[derive(Debug, Clone, Copy)]
pub struct DivergenceCriterion {
    kind: DivergenceKind,
    alpha: f64,
}

impl DivergenceCriterion {
    pub fn new(kind: DivergenceKind, alpha: f64) -> Self {
        Self { kind, alpha }
    }

    pub fn kind(&self) -> DivergenceKind {
        self.kind
    }

    /// Compute the weighted divergence between `input` and `target` logits.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let input = flatten_logits(input)?;
        let target = flatten_logits(target)?;
        let loss = match self.kind {
            DivergenceKind::Symmetric => symmetric_kl(&input, &target)?,
            DivergenceKind::JensenShannon => js_divergence(&input, &target)?,
        };
        Ok((loss * self.alpha)?)
    }
}

impl Default for DivergenceCriterion {
    fn default() -> Self {
        Self::new(DivergenceKind::Symmetric, 1.0)
    }
}

/// `KL(input || target.detach) + KL(target || input.detach)`.
fn symmetric_kl(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let input_frozen = input.detach();
    let target_frozen = target.detach();

    let forward = kl_div_batchmean(
        &log_softmax(input, D::Minus1)?,
        &softmax(&target_frozen, D::Minus1)?,
        &log_softmax(&target_frozen, D::Minus1)?,
    )?;
    let backward = kl_div_batchmean(
        &log_softmax(target, D::Minus1)?,
        &softmax(&input_frozen, D::Minus1)?,
        &log_softmax(&input_frozen, D::Minus1)?,
    )?;
    Ok((forward + backward)?)
}

/// Both sides measured against their detached mixture `m`.
fn js_divergence(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let mixture = ((softmax(&target.detach(), D::Minus1)?
        + softmax(&input.detach(), D::Minus1)?)?
        * 0.5)?;
    // Softmax underflow can leave exact zeros in f32.
    let mixture_log = mixture.clamp(f32::MIN_POSITIVE, 1.0f32)?.log()?;

    let lhs = kl_div_batchmean(&log_softmax(input, D::Minus1)?, &mixture, &mixture_log)?;
    let rhs = kl_div_batchmean(&log_softmax(target, D::Minus1)?, &mixture, &mixture_log)?;
    Ok((lhs + rhs)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
