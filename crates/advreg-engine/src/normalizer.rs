//! Gradient direction normalization.
//!
//! Turns a raw gradient into a bounded step direction under the configured
//! norm. Reductions run over the last axis (per token) or, with
//! `sentence_level`, over the last two axes jointly (per sequence).

use advreg_core::{NormType, Result};
use candle_core::{Tensor, D};

/// Lower bound applied to every normalization denominator.
pub const DENOMINATOR_FLOOR: f64 = 1e-8;

/// Step direction plus the optional companion direction.
#[derive(Debug, Clone)]
pub struct NormalizedDirection {
    pub direction: Tensor,
    /// Companion gradient divided by the same denominator as `direction`.
    pub effective: Option<Tensor>,
}

/// Normalizes gradients row-wise under a fixed norm.
#[derive(Debug, Clone, Copy)]
pub struct GradientNormalizer {
    norm_type: NormType,
    /// Additive smoothing term on the denominator.
    max_norm: f64,
    sentence_level: bool,
}

impl GradientNormalizer {
    pub fn new(norm_type: NormType, max_norm: f64, sentence_level: bool) -> Self {
        Self {
            norm_type,
            max_norm,
            sentence_level,
        }
    }

    pub fn norm_type(&self) -> NormType {
        self.norm_type
    }

    /// Normalize `grad`, and `effective_grad` alongside it when given.
    pub fn normalize(
        &self,
        grad: &Tensor,
        effective_grad: Option<&Tensor>,
    ) -> Result<NormalizedDirection> {
        match self.norm_type {
            NormType::L1 => Ok(NormalizedDirection {
                direction: sign(grad)?,
                effective: effective_grad.map(sign).transpose()?,
            }),
            NormType::L2 | NormType::LInf => {
                let denominator = self.denominator(grad)?;
                let direction = grad.broadcast_div(&denominator)?;
                let effective = match effective_grad {
                    Some(eff) => Some(eff.broadcast_div(&denominator)?),
                    None => None,
                };
                Ok(NormalizedDirection {
                    direction,
                    effective,
                })
            }
        }
    }

    fn denominator(&self, grad: &Tensor) -> Result<Tensor> {
        let reduced = if self.sentence_level && grad.rank() >= 2 {
            // Merge the token and hidden axes, reduce, then restore both as size 1.
            let merged = grad.flatten_from(D::Minus2)?;
            row_norm(&merged, self.norm_type)?.unsqueeze(D::Minus1)?
        } else {
            row_norm(grad, self.norm_type)?
        };
        Ok((reduced + self.max_norm)?.maximum(DENOMINATOR_FLOOR)?)
    }
}

/// Norm over the last axis, keeping it as size 1.
fn row_norm(t: &Tensor, norm_type: NormType) -> Result<Tensor> {
    let norm = match norm_type {
        NormType::L2 => t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?,
        NormType::LInf | NormType::L1 => t.abs()?.max_keepdim(D::Minus1)?,
    };
    Ok(norm)
}

/// Elementwise sign: -1, 0 or 1 in the input dtype.
pub fn sign(t: &Tensor) -> Result<Tensor> {
    let positive = t.gt(0.0)?.to_dtype(t.dtype())?;
    let negative = t.lt(0.0)?.to_dtype(t.dtype())?;
    Ok((positive - negative)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn grad(device: &Device) -> Tensor {
        Tensor::new(
            &[
                [[3.0f32, -4.0, 0.0], [0.5, 0.25, -0.125]],
                [[-10.0, 2.0, 1.0], [0.0, 0.0, 0.0]],
            ],
            device,
        )
        .unwrap()
    }

    #[test]
    fn test_linf_rows_bounded_by_one() {
        let device = Device::Cpu;
        let g = grad(&device);
        let normalizer = GradientNormalizer::new(NormType::LInf, 1e-5, false);
        let out = normalizer.normalize(&g, None).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = out.direction.to_vec3().unwrap();
        for row in rows.iter().flatten() {
            let max = row.iter().fold(0f32, |m, v| m.max(v.abs()));
            assert!(max <= 1.0 + 1e-6, "row max {max}");
        }
        // A non-zero row reaches (almost) unit magnitude.
        assert!((rows[0][0][1].abs() - 1.0).abs() < 1e-4);
        assert!(out.effective.is_none());
    }

    #[test]
    fn test_l1_is_sign() {
        let device = Device::Cpu;
        let g = grad(&device);
        let normalizer = GradientNormalizer::new(NormType::L1, 1e-5, false);
        let out = normalizer.normalize(&g, None).unwrap();
        let values: Vec<f32> = out.direction.flatten_all().unwrap().to_vec1().unwrap();
        for v in &values {
            assert!(*v == -1.0 || *v == 0.0 || *v == 1.0, "unexpected {v}");
        }
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], -1.0);
        assert_eq!(values[2], 0.0);
    }

    #[test]
    fn test_l2_rows_unit_or_less() {
        let device = Device::Cpu;
        let g = grad(&device);
        let normalizer = GradientNormalizer::new(NormType::L2, 0.0, false);
        let out = normalizer.normalize(&g, None).unwrap();
        let norms: Vec<Vec<f32>> = out
            .direction
            .sqr()
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec2()
            .unwrap();
        for n in norms.iter().flatten() {
            assert!(*n <= 1.0 + 1e-5, "row norm {n}");
        }
        // [3, -4, 0] has norm 5.
        assert!((norms[0][0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_gradient_without_smoothing_stays_finite() {
        let device = Device::Cpu;
        let g = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        for norm in [NormType::L2, NormType::LInf] {
            let normalizer = GradientNormalizer::new(norm, 0.0, false);
            let out = normalizer.normalize(&g, None).unwrap();
            let values: Vec<f32> = out.direction.flatten_all().unwrap().to_vec1().unwrap();
            assert!(values.iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_sentence_level_reduces_whole_sequence() {
        let device = Device::Cpu;
        let g = grad(&device);
        let normalizer = GradientNormalizer::new(NormType::LInf, 0.0, true);
        let out = normalizer.normalize(&g, None).unwrap();
        assert_eq!(out.direction.dims(), g.dims());
        let rows: Vec<Vec<Vec<f32>>> = out.direction.to_vec3().unwrap();
        // Example 1: sequence max is |-10|, so the second token stays tiny.
        assert!((rows[1][0][0] + 1.0).abs() < 1e-6);
        assert!((rows[1][0][1] - 0.2).abs() < 1e-6);
        // Example 0: sequence max is |-4|, shared by both tokens.
        assert!((rows[0][1][0] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_effective_direction_shares_denominator() {
        let device = Device::Cpu;
        let g = grad(&device);
        let eff = (&g * 0.5).unwrap();
        let normalizer = GradientNormalizer::new(NormType::LInf, 1e-5, false);
        let out = normalizer.normalize(&g, Some(&eff)).unwrap();
        let direction: Vec<f32> = out.direction.flatten_all().unwrap().to_vec1().unwrap();
        let effective: Vec<f32> = out
            .effective
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (d, e) in direction.iter().zip(&effective) {
            assert!((d * 0.5 - e).abs() < 1e-6);
        }
    }
}
