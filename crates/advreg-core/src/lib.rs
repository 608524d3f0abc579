//! Core types, configuration, and errors for advreg
//!
//! This crate contains the configuration surface and error type shared by the
//! adversarial training engine and the training pipeline. Every component
//! receives its configuration explicitly by reference; nothing here is global.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod config;

pub use config::{load_config, parse_config};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Geometry used to normalize ascent steps and to project perturbations.
///
/// Fixed for the whole perturbation search within one training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormType {
    /// Sign of the gradient; magnitude ignored.
    L1,
    /// Euclidean norm.
    L2,
    /// Maximum absolute component.
    #[default]
    LInf,
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::LInf => "linf",
        };
        f.write_str(s)
    }
}

impl FromStr for NormType {
    type Err = AdvRegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "linf" => Ok(Self::LInf),
            other => Err(AdvRegError::Config(format!(
                "unsupported norm type '{other}' (expected l1, l2 or linf)"
            ))),
        }
    }
}

/// Which adversarial training strategy drives a training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    /// KL-driven search on the perturbation only, symmetric/JS consistency loss.
    #[default]
    #[serde(rename = "smart")]
    Smart,
    /// Search driven by the supervised loss, stable KL consistency loss.
    #[serde(rename = "vat", alias = "virtual")]
    Virtual,
    /// Parameter gradients accumulated through every ascent step.
    #[serde(rename = "freelb")]
    FreeLb,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Smart => "smart",
            Self::Virtual => "vat",
            Self::FreeLb => "freelb",
        };
        f.write_str(s)
    }
}

impl FromStr for StrategyKind {
    type Err = AdvRegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smart" => Ok(Self::Smart),
            "vat" | "virtual" => Ok(Self::Virtual),
            "freelb" => Ok(Self::FreeLb),
            other => Err(AdvRegError::Config(format!(
                "unsupported adversarial strategy '{other}' (expected smart, vat or freelb)"
            ))),
        }
    }
}

/// Consistency loss between clean and perturbed predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DivergenceKind {
    /// KL in both directions, each with the opposite side detached.
    #[default]
    #[serde(rename = "symmetric")]
    Symmetric,
    /// KL of both sides against their (detached) mixture.
    #[serde(rename = "js")]
    JensenShannon,
}

impl FromStr for DivergenceKind {
    type Err = AdvRegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symmetric" | "sym" => Ok(Self::Symmetric),
            "js" | "jensen-shannon" => Ok(Self::JensenShannon),
            other => Err(AdvRegError::Config(format!(
                "unsupported divergence '{other}' (expected symmetric or js)"
            ))),
        }
    }
}

/// How an ascent step turns the perturbation gradient into an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRule {
    /// Step along the gradient scaled by its per-example norm, then clip.
    #[default]
    PerExample,
    /// Renormalize `perturbation + step_size * grad` row-wise.
    RowNormalized,
}

impl FromStr for UpdateRule {
    type Err = AdvRegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_example" => Ok(Self::PerExample),
            "row_normalized" => Ok(Self::RowNormalized),
            other => Err(AdvRegError::Config(format!(
                "unsupported update rule '{other}' (expected per_example or row_normalized)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Hyperparameters of the adversarial perturbation search.
///
/// Immutable for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversarialConfig {
    /// Strategy selected for every training step.
    pub strategy: StrategyKind,
    /// Number of gradient ascent steps, at least 1.
    pub steps: usize,
    /// Ascent step size.
    pub step_size: f64,
    /// Magnitude of the uniform initial perturbation (0 disables it).
    pub init_mag: f64,
    /// Scale of the Gaussian initial perturbation (0 disables it).
    pub noise_var: f64,
    /// Maximum perturbation norm, 0 means unconstrained.
    pub max_norm: f64,
    /// Projection geometry.
    pub norm_type: NormType,
    /// Weight of the consistency loss in the combined objective.
    pub alpha: f64,
    /// Consistency loss used by the `smart` strategy.
    pub divergence: DivergenceKind,
    /// Ascent update rule.
    pub update_rule: UpdateRule,
    /// Normalize per whole sequence instead of per token.
    pub sentence_level: bool,
}

impl Default for AdversarialConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Smart,
            steps: 1,
            step_size: 1e-4,
            init_mag: 0.0,
            noise_var: 1e-5,
            max_norm: 1e-5,
            norm_type: NormType::LInf,
            alpha: 1.0,
            divergence: DivergenceKind::Symmetric,
            update_rule: UpdateRule::PerExample,
            sentence_level: false,
        }
    }
}

impl AdversarialConfig {
    /// Check the invariants the search relies on.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(AdvRegError::Config(
                "adversarial steps must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("step_size", self.step_size),
            ("init_mag", self.init_mag),
            ("noise_var", self.noise_var),
            ("max_norm", self.max_norm),
            ("alpha", self.alpha),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AdvRegError::Config(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Whether projection onto the max-norm ball is enabled.
    pub fn is_bounded(&self) -> bool {
        self.max_norm > 0.0
    }
}

/// Outer optimization and data settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub lr: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub max_length: usize,
    /// Fraction of total steps spent in linear warmup.
    pub warmup_ratio: f64,
    pub seed: u64,
    /// `auto`, `cpu`, `cuda:N` or `metal:N`.
    pub device: String,
    pub ckpt_dir: String,
    /// Emit a progress line every this many steps (0 disables).
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-5,
            weight_decay: 0.0,
            batch_size: 16,
            epochs: 10,
            max_length: 512,
            warmup_ratio: 0.1,
            seed: 42,
            device: "auto".to_string(),
            ckpt_dir: "./checkpoints".to_string(),
            log_every: 50,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AdvRegError::Config("batch_size must be positive".to_string()));
        }
        if self.epochs == 0 {
            return Err(AdvRegError::Config("epochs must be positive".to_string()));
        }
        if self.max_length == 0 {
            return Err(AdvRegError::Config("max_length must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(AdvRegError::Config(format!(
                "warmup_ratio must lie in [0, 1], got {}",
                self.warmup_ratio
            )));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(AdvRegError::Config(format!(
                "lr must be positive, got {}",
                self.lr
            )));
        }
        Ok(())
    }
}

/// Shape of the built-in pooled classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_labels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_dim: 128,
            num_labels: 3,
        }
    }
}

/// Everything one run needs, as loaded from YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub adversarial: AdversarialConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.num_labels < 2 {
            return Err(AdvRegError::Config(
                "num_labels must be at least 2".to_string(),
            ));
        }
        self.training.validate()?;
        self.adversarial.validate()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error types
#[derive(thiserror::Error, Debug)]
pub enum AdvRegError {
    /// Tensor computation error.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset loading or encoding error.
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint persistence error.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, AdvRegError>`.
pub type Result<T> = std::result::Result<T, AdvRegError>;
