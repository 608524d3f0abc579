//! Review datasets: JSONL loading, stratified splitting, tokenization, and
//! batch iteration.
//!
//! A domain lives under `<data_dir>/<domain>/` as `train.jsonl`, optional
//! `val.jsonl` and optional `test.jsonl`, one `{"text": ..., "label": ...}`
//! object per line.

use std::collections::BTreeMap;
use std::path::Path;

use advreg_core::{AdvRegError, Result};
use advreg_engine::Batch;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Default fraction of the training file held out when no `val.jsonl` exists.
pub const DEFAULT_VAL_RATIO: f64 = 0.2;

/// One labeled review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSample {
    pub text: String,
    pub label: i64,
}

/// Labeled splits of one domain.
#[derive(Debug, Clone)]
pub struct DomainSplits {
    pub domain: String,
    pub train: Vec<ReviewSample>,
    pub val: Vec<ReviewSample>,
    pub test: Option<Vec<ReviewSample>>,
}

/// Read a JSONL file of [`ReviewSample`]s. Blank lines are ignored.
pub fn read_jsonl(path: &Path) -> Result<Vec<ReviewSample>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AdvRegError::Data(format!("Failed to read {}: {e}", path.display())))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let sample: ReviewSample = serde_json::from_str(line).map_err(|e| {
                AdvRegError::Data(format!("{}:{}: invalid sample: {e}", path.display(), i + 1))
            })?;
            if sample.label < 0 {
                return Err(AdvRegError::Data(format!(
                    "{}:{}: negative label {}",
                    path.display(),
                    i + 1,
                    sample.label
                )));
            }
            Ok(sample)
        })
        .collect()
}

/// Load the splits of `domain`, carving a stratified validation split out of
/// the training file when `val.jsonl` is absent.
pub fn load_domain(data_dir: &Path, domain: &str, val_ratio: f64, seed: u64) -> Result<DomainSplits> {
    let dir = data_dir.join(domain);
    let train = read_jsonl(&dir.join("train.jsonl"))?;

    let val_path = dir.join("val.jsonl");
    let (train, val) = if val_path.exists() {
        (train, read_jsonl(&val_path)?)
    } else {
        let (train, val) = stratified_split(&train, val_ratio, seed);
        tracing::info!(
            domain,
            train = train.len(),
            val = val.len(),
            "no val.jsonl, using stratified split"
        );
        (train, val)
    };

    let test_path = dir.join("test.jsonl");
    let test = if test_path.exists() {
        Some(read_jsonl(&test_path)?)
    } else {
        None
    };

    Ok(DomainSplits {
        domain: domain.to_string(),
        train,
        val,
        test,
    })
}

/// Split samples into `(train, val)` preserving per-class ratios.
///
/// Each class contributes `round(count * val_ratio)` samples to validation.
pub fn stratified_split(
    samples: &[ReviewSample],
    val_ratio: f64,
    seed: u64,
) -> (Vec<ReviewSample>, Vec<ReviewSample>) {
    let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, sample) in samples.iter().enumerate() {
        by_class.entry(sample.label).or_default().push(i);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut val = Vec::new();
    for indices in by_class.values_mut() {
        indices.shuffle(&mut rng);
        let n_val = ((indices.len() as f64 * val_ratio).round() as usize).min(indices.len());
        val.extend(indices[..n_val].iter().map(|&i| samples[i].clone()));
        train.extend(indices[n_val..].iter().map(|&i| samples[i].clone()));
    }
    (train, val)
}

/// Turns text into token ids.
pub trait TokenEncoder {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;

    /// Id used for padding positions.
    fn pad_id(&self) -> u32 {
        0
    }

    /// Number of distinct ids the encoder can emit, when known.
    fn vocab_size(&self) -> Option<usize> {
        None
    }
}

impl TokenEncoder for tokenizers::Tokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, true)
            .map_err(|e| AdvRegError::Data(format!("Tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_id(&self) -> u32 {
        self.get_padding().map(|p| p.pad_id).unwrap_or(0)
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(self.get_vocab_size(true))
    }
}

/// Load a `tokenizer.json`.
pub fn load_tokenizer(path: &Path) -> Result<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path).map_err(|e| {
        AdvRegError::Data(format!("Failed to load tokenizer {}: {e}", path.display()))
    })
}

/// Truncate or pad `ids` to exactly `max_length`, returning ids and mask.
pub fn pad_or_truncate(ids: &[u32], max_length: usize, pad_id: u32) -> (Vec<u32>, Vec<u32>) {
    let kept = ids.len().min(max_length);
    let mut out = Vec::with_capacity(max_length);
    out.extend_from_slice(&ids[..kept]);
    out.resize(max_length, pad_id);

    let mut mask = vec![1u32; kept];
    mask.resize(max_length, 0);
    (out, mask)
}

/// Fixed-length encoded split held as tensors.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    /// `[N, max_length]` u32.
    pub input_ids: Tensor,
    /// `[N, max_length]` u32.
    pub attention_mask: Tensor,
    /// `[N]` i64.
    pub labels: Tensor,
}

impl EncodedDataset {
    /// Encode `samples` with `encoder`, truncated/padded to `max_length`.
    pub fn encode<E: TokenEncoder + ?Sized>(
        encoder: &E,
        samples: &[ReviewSample],
        max_length: usize,
        device: &Device,
    ) -> Result<Self> {
        let n = samples.len();
        let mut ids = Vec::with_capacity(n * max_length);
        let mut mask = Vec::with_capacity(n * max_length);
        let mut labels = Vec::with_capacity(n);

        for sample in samples {
            let raw = encoder.encode_ids(&sample.text)?;
            let (padded, sample_mask) = pad_or_truncate(&raw, max_length, encoder.pad_id());
            ids.extend(padded);
            mask.extend(sample_mask);
            labels.push(sample.label);
        }

        Self::from_parts(ids, mask, labels, max_length, device)
    }

    /// Assemble from flat row-major buffers.
    pub fn from_parts(
        ids: Vec<u32>,
        mask: Vec<u32>,
        labels: Vec<i64>,
        max_length: usize,
        device: &Device,
    ) -> Result<Self> {
        let n = labels.len();
        if ids.len() != n * max_length || mask.len() != n * max_length {
            return Err(AdvRegError::Data(format!(
                "expected {} ids and mask values for {n} samples of length {max_length}, got {} and {}",
                n * max_length,
                ids.len(),
                mask.len()
            )));
        }
        Ok(Self {
            input_ids: Tensor::from_vec(ids, (n, max_length), device)?,
            attention_mask: Tensor::from_vec(mask, (n, max_length), device)?,
            labels: Tensor::from_vec(labels, n, device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_length(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }

    /// Gather the given rows as one batch.
    pub fn batch(&self, rows: &[usize]) -> Result<Batch> {
        let idx: Vec<u32> = rows.iter().map(|&i| i as u32).collect();
        let idx = Tensor::new(idx.as_slice(), self.labels.device())?;
        Ok(Batch {
            input_ids: self.input_ids.index_select(&idx, 0)?,
            attention_mask: self.attention_mask.index_select(&idx, 0)?,
            labels: self.labels.index_select(&idx, 0)?,
        })
    }
}

/// Mini-batch iterator over an [`EncodedDataset`].
///
/// Keeps dataset order until [`BatchIterator::reshuffle`] is called.
pub struct BatchIterator<'a> {
    dataset: &'a EncodedDataset,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl<'a> BatchIterator<'a> {
    pub fn new(dataset: &'a EncodedDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Number of batches in one full pass.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchIterator<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.indices.len();
        if self.pos >= n {
            return None;
        }
        let end = (self.pos + self.batch_size).min(n);
        let rows = &self.indices[self.pos..end];
        self.pos = end;
        Some(self.dataset.batch(rows))
    }
}
