//! Linear warmup then linear decay of the learning rate.

use candle_nn::Optimizer;

/// Learning rate ramps from 0 to `base_lr` over the warmup steps, then decays
/// linearly to 0 at `total_steps`.
///
/// The warmup length is `warmup_ratio * total_steps` and may be fractional.
/// Step `s` gets `s / max(1, warmup)` during warmup and
/// `(total - s) / max(1, total - warmup)` afterwards.
#[derive(Debug, Clone)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: f64,
    total_steps: usize,
    current: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (warmup_ratio * total_steps as f64).max(0.0);
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current: 0,
        }
    }

    /// A schedule that never changes the rate.
    pub fn constant(base_lr: f64) -> Self {
        Self {
            base_lr,
            warmup_steps: 0.0,
            total_steps: 0,
            current: 0,
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let step = step as f64;
        if step < self.warmup_steps {
            return self.base_lr * step / self.warmup_steps.max(1.0);
        }
        let total = self.total_steps as f64;
        let span = (total - self.warmup_steps).max(1.0);
        self.base_lr * ((total - step) / span).max(0.0)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.current)
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    /// Advance one step and push the new rate into `optimizer`.
    pub fn advance<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.current += 1;
        optimizer.set_learning_rate(self.current_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_warmup_decays_to_zero() {
        let s = LinearSchedule::new(1.0, 0.0, 10);
        assert!((s.lr_at(0) - 1.0).abs() < 1e-12);
        assert!((s.lr_at(5) - 0.5).abs() < 1e-12);
        assert!(s.lr_at(10).abs() < 1e-12);
        assert!(s.lr_at(20).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_ramps_up() {
        let s = LinearSchedule::new(2.0, 0.2, 10);
        assert!(s.lr_at(0).abs() < 1e-12);
        assert!((s.lr_at(1) - 1.0).abs() < 1e-12);
        assert!((s.lr_at(2) - 2.0).abs() < 1e-12);
        assert!((s.lr_at(6) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fractional_warmup_is_not_rounded() {
        // 10% of 25 steps is 2.5 warmup steps.
        let s = LinearSchedule::new(1.0, 0.1, 25);
        assert!((s.lr_at(1) - 0.4).abs() < 1e-12);
        assert!((s.lr_at(2) - 0.8).abs() < 1e-12);
        assert!((s.lr_at(3) - 22.0 / 22.5).abs() < 1e-12);
        assert!(s.lr_at(25).abs() < 1e-12);
    }

    #[test]
    fn test_constant_schedule() {
        let s = LinearSchedule::constant(0.3);
        assert!((s.lr_at(0) - 0.3).abs() < 1e-12);
        assert!((s.lr_at(1000) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_advance_sets_optimizer_rate() {
        use candle_core::{DType, Device, Var};
        use candle_nn::{AdamW, ParamsAdamW};

        let var = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let mut opt = AdamW::new(
            vec![var],
            ParamsAdamW {
                lr: 1.0,
                ..Default::default()
            },
        )
        .unwrap();
        let mut s = LinearSchedule::new(1.0, 0.0, 4);
        s.advance(&mut opt);
        assert_eq!(s.current_step(), 1);
        assert!((opt.learning_rate() - 0.75).abs() < 1e-12);
    }
}
