//! Adversarial regularization engine for advreg
//!
//! This crate implements embedding-space adversarial training for sequence
//! classifiers: a numerically stable KL estimator, symmetric and
//! Jensen-Shannon consistency losses, gradient direction normalization, the
//! bounded perturbation search, three training strategies (`smart`, `vat`,
//! `freelb`) and the training step orchestrator that applies them.
//!
//! The classification network is reached only through
//! [`SequenceClassifier`](classifier::SequenceClassifier); a small
//! [`PooledClassifier`](classifier::PooledClassifier) ships for end-to-end use.
//!
//! # Feature Flags
//!
//! - `cuda`: enable CUDA device selection
//! - `metal`: enable Metal device selection

pub mod classifier;
pub mod device;
pub mod divergence;
pub mod normalizer;
pub mod orchestrator;
pub mod perturbation;
pub mod schedule;
pub mod strategy;

pub use classifier::{
    masked_mean_pool, Batch, ClassifierOutput, PooledClassifier, SequenceClassifier,
};
pub use device::{resolve_device, select_device};
pub use divergence::{stable_kl, DivergenceCriterion, STABLE_KL_EPSILON};
pub use normalizer::{GradientNormalizer, NormalizedDirection};
pub use orchestrator::{build_optimizer, EpochSummary, StepOutcome, TrainingStep};
pub use perturbation::{
    linf_magnitude, PerturbationSearch, SearchObjective, SearchOutcome, SearchResult,
};
pub use schedule::LinearSchedule;
pub use strategy::{
    build_strategy, AdversarialOutcome, AdversarialStrategy, FreeLbStrategy, SmartStrategy,
    StepStats, VirtualStrategy,
};
