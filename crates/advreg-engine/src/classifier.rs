//! Sequence classifier collaborator.
//!
//! The adversarial engine talks to the classification network only through
//! [`SequenceClassifier`]: an embedding lookup, and a forward pass that takes
//! embeddings directly so the token-embedding path can be bypassed when a
//! perturbation has been added.
//!
//! [`PooledClassifier`] is a small built-in implementation (embedding table,
//! masked mean pooling, two dense layers) used by the CLI and the tests.
//!
//! # Architecture
//!
//! ```text
//! ids → Embedding(vocab, hidden) → masked mean pool → Linear(hidden) → tanh → Linear(labels)
//! ```

use std::path::Path;

use advreg_core::{AdvRegError, ModelConfig, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// One mini-batch as yielded by the data pipeline.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, seq_len]` token ids (u32).
    pub input_ids: Tensor,
    /// `[batch, seq_len]`, 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
    /// `[batch]` class indices (i64).
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(loss, logits, hidden_states, attentions)` of one forward pass.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    /// Supervised loss, present when labels were supplied.
    pub loss: Option<Tensor>,
    /// `[batch, num_labels]`.
    pub logits: Tensor,
    pub hidden_states: Option<Tensor>,
    pub attentions: Option<Tensor>,
}

impl ClassifierOutput {
    /// The supervised loss, or an error if the forward ran without labels.
    pub fn require_loss(&self) -> Result<Tensor> {
        self.loss.clone().ok_or_else(|| {
            AdvRegError::Data("classifier returned no supervised loss; labels missing".to_string())
        })
    }
}

/// Contract of the external classification network.
pub trait SequenceClassifier {
    /// Pure embedding lookup: `[batch, seq_len]` ids to `[batch, seq_len, hidden]`.
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Forward pass from embeddings; the token-embedding lookup is skipped.
    fn forward_embeds(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<ClassifierOutput>;

    /// Forward pass from token ids.
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<ClassifierOutput> {
        let embeds = self.embed(input_ids)?;
        self.forward_embeds(&embeds, attention_mask, labels)
    }

    /// Trainable parameters.
    fn parameters(&self) -> Vec<Var>;
}

/// Compute masked average pooling over the sequence dimension.
///
/// `hidden_states` has shape `[batch, seq_len, hidden_size]`.
/// `attention_mask` has shape `[batch, seq_len]` with `1` for real tokens and `0` for padding.
///
/// Returns a tensor of shape `[batch, hidden_size]`.
pub fn masked_mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(hidden_states.dtype())?;
    let mask_3d = mask.unsqueeze(2)?.broadcast_as(hidden_states.shape())?;
    let summed = hidden_states.broadcast_mul(&mask_3d)?.sum(1)?;
    let counts = mask.sum(1)?.unsqueeze(1)?.broadcast_as(summed.shape())?;
    // A fully padded row pools to zero instead of NaN.
    let counts = (counts + 1e-9)?;
    Ok(summed.broadcast_div(&counts)?)
}

/// Embedding-bag classifier trained from scratch.
pub struct PooledClassifier {
    embeddings: candle_nn::Embedding,
    dense: candle_nn::Linear,
    classifier: candle_nn::Linear,
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
}

impl PooledClassifier {
    /// Create a classifier with freshly initialized weights.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embeddings =
            candle_nn::embedding(config.vocab_size, config.hidden_dim, vb.pp("embeddings"))?;
        let dense = candle_nn::linear(config.hidden_dim, config.hidden_dim, vb.pp("dense"))?;
        let classifier = candle_nn::linear(config.hidden_dim, config.num_labels, vb.pp("classifier"))?;

        Ok(Self {
            embeddings,
            dense,
            classifier,
            varmap,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Create a classifier whose weights are drawn from a seeded generator.
    ///
    /// Every parameter is filled, in name order, with uniform values in
    /// `[-1/sqrt(d), 1/sqrt(d)]` where `d` is its last dimension, so the same
    /// seed always yields the same model.
    pub fn seeded(config: &ModelConfig, device: &Device, seed: u64) -> Result<Self> {
        let model = Self::new(config, device)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        {
            let vars = model.varmap.data().lock().map_err(|_| {
                AdvRegError::Checkpoint("classifier parameter store is poisoned".to_string())
            })?;
            let mut names: Vec<&String> = vars.keys().collect();
            names.sort();
            for name in names {
                let var = &vars[name];
                let dims = var.dims().to_vec();
                let fan = dims.last().copied().unwrap_or(1).max(1);
                let bound = 1.0 / (fan as f32).sqrt();
                let values: Vec<f32> = (0..var.elem_count())
                    .map(|_| rng.gen_range(-bound..=bound))
                    .collect();
                var.set(&Tensor::from_vec(values, dims, device)?)?;
            }
        }
        Ok(model)
    }

    /// Load weights previously written by [`PooledClassifier::save`].
    pub fn load(path: &Path, config: &ModelConfig, device: &Device) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.varmap.load(path).map_err(|e| {
            AdvRegError::Checkpoint(format!(
                "Failed to load classifier weights from {}: {e}",
                path.display()
            ))
        })?;
        Ok(model)
    }

    /// Write all parameters as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path).map_err(|e| {
            AdvRegError::Checkpoint(format!(
                "Failed to save classifier weights to {}: {e}",
                path.display()
            ))
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl SequenceClassifier for PooledClassifier {
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embeddings.forward(input_ids)?)
    }

    fn forward_embeds(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<ClassifierOutput> {
        let pooled = masked_mean_pool(inputs_embeds, attention_mask)?;
        let hidden = self.dense.forward(&pooled)?.tanh()?;
        let logits = self.classifier.forward(&hidden)?;
        let loss = match labels {
            Some(labels) => Some(candle_nn::loss::cross_entropy(&logits, labels)?),
            None => None,
        };
        Ok(ClassifierOutput {
            loss,
            logits,
            hidden_states: Some(hidden),
            attentions: None,
        })
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
