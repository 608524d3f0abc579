//! Tokenize a domain once and cache it as safetensors.
//!
//! For each split of the domain:
//! 1. Tokenize every review and truncate/pad to `max_length`
//! 2. Store `input_ids`, `attention_mask` (u32) and `labels` (i64) in
//!    `<cache_dir>/<domain>/<split>.safetensors`
//! 3. Record split sizes and class counts in `<cache_dir>/<domain>/manifest.json`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use advreg_core::{AdvRegError, Result};
use candle_core::Device;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde::{Deserialize, Serialize};

use crate::data::{load_domain, DomainSplits, EncodedDataset, ReviewSample, TokenEncoder};

/// Cached split of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl std::str::FromStr for Split {
    type Err = AdvRegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "val" | "validation" => Ok(Self::Val),
            "test" => Ok(Self::Test),
            other => Err(AdvRegError::Config(format!(
                "unknown split '{other}' (expected train, val or test)"
            ))),
        }
    }
}

/// Entry in the precompute manifest describing one cached split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitEntry {
    pub split: Split,
    pub samples: usize,
    /// Sample count per label, indexed by label.
    pub class_counts: Vec<usize>,
}

/// Precompute manifest stored alongside the safetensors files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputeManifest {
    pub domain: String,
    pub max_length: usize,
    pub num_labels: usize,
    /// Embedding rows needed to look up every cached id.
    #[serde(default)]
    pub vocab_size: usize,
    pub splits: Vec<SplitEntry>,
}

impl PrecomputeManifest {
    pub fn entry(&self, split: Split) -> Option<&SplitEntry> {
        self.splits.iter().find(|e| e.split == split)
    }
}

/// Directory holding the cache of `domain`.
pub fn domain_cache_dir(cache_dir: &Path, domain: &str) -> PathBuf {
    cache_dir.join(domain)
}

/// Run the precompute step for one domain and write its cache.
pub fn precompute<E: TokenEncoder + ?Sized>(
    encoder: &E,
    data_dir: &Path,
    domain: &str,
    cache_dir: &Path,
    max_length: usize,
    val_ratio: f64,
    seed: u64,
) -> Result<PrecomputeManifest> {
    let splits = load_domain(data_dir, domain, val_ratio, seed)?;
    println!(
        "Loaded domain '{}': train={} val={} test={}",
        domain,
        splits.train.len(),
        splits.val.len(),
        splits.test.as_ref().map_or(0, Vec::len),
    );
    write_cache(encoder, &splits, cache_dir, max_length)
}

/// Encode the splits of a loaded domain and write them under `cache_dir`.
pub fn write_cache<E: TokenEncoder + ?Sized>(
    encoder: &E,
    splits: &DomainSplits,
    cache_dir: &Path,
    max_length: usize,
) -> Result<PrecomputeManifest> {
    let out_dir = domain_cache_dir(cache_dir, &splits.domain);
    std::fs::create_dir_all(&out_dir).map_err(|e| {
        AdvRegError::Data(format!("Failed to create {}: {e}", out_dir.display()))
    })?;

    let mut parts: Vec<(Split, &[ReviewSample])> = vec![
        (Split::Train, splits.train.as_slice()),
        (Split::Val, splits.val.as_slice()),
    ];
    if let Some(test) = &splits.test {
        parts.push((Split::Test, test.as_slice()));
    }

    let num_labels = parts
        .iter()
        .flat_map(|(_, samples)| samples.iter().map(|s| s.label))
        .max()
        .map_or(0, |max| max as usize + 1);

    let mut entries = Vec::with_capacity(parts.len());
    let mut vocab_size = encoder.vocab_size().unwrap_or(0);
    for (split, samples) in parts {
        let dataset = EncodedDataset::encode(encoder, samples, max_length, &Device::Cpu)?;
        if !dataset.is_empty() {
            let max_id = dataset.input_ids.flatten_all()?.max(0)?.to_scalar::<u32>()?;
            vocab_size = vocab_size.max(max_id as usize + 1);
        }
        save_split(&out_dir.join(format!("{}.safetensors", split.name())), &dataset)?;

        let mut class_counts = vec![0usize; num_labels];
        for sample in samples {
            class_counts[sample.label as usize] += 1;
        }
        println!("  {:<5} [{}, {}] {:?}", split.name(), samples.len(), max_length, class_counts);
        entries.push(SplitEntry {
            split,
            samples: samples.len(),
            class_counts,
        });
    }

    let manifest = PrecomputeManifest {
        domain: splits.domain.clone(),
        max_length,
        num_labels,
        vocab_size,
        splits: entries,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(out_dir.join("manifest.json"), manifest_json)?;

    println!("  output dir: {}", out_dir.display());
    Ok(manifest)
}

/// Read `<cache_dir>/<domain>/manifest.json`.
pub fn load_manifest(cache_dir: &Path, domain: &str) -> Result<PrecomputeManifest> {
    let path = domain_cache_dir(cache_dir, domain).join("manifest.json");
    let manifest_str = std::fs::read_to_string(&path)
        .map_err(|e| AdvRegError::Data(format!("Failed to read manifest {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&manifest_str)?)
}

/// Load one cached split onto `device`.
pub fn load_split(
    cache_dir: &Path,
    domain: &str,
    split: Split,
    device: &Device,
) -> Result<EncodedDataset> {
    let path = domain_cache_dir(cache_dir, domain).join(format!("{}.safetensors", split.name()));
    let data = std::fs::read(&path)
        .map_err(|e| AdvRegError::Data(format!("Failed to read {}: {e}", path.display())))?;
    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        AdvRegError::Data(format!("Failed to parse safetensor {}: {e}", path.display()))
    })?;

    let view = |name: &str| {
        tensors.tensor(name).map_err(|e| {
            AdvRegError::Data(format!("Tensor '{name}' not found in {}: {e}", path.display()))
        })
    };
    let ids = view("input_ids")?;
    let mask = view("attention_mask")?;
    let labels = view("labels")?;

    let max_length = ids.shape().get(1).copied().unwrap_or(0);
    let ids: Vec<u32> = ids
        .data()
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let mask: Vec<u32> = mask
        .data()
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let labels: Vec<i64> = labels
        .data()
        .chunks_exact(8)
        .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect();

    EncodedDataset::from_parts(ids, mask, labels, max_length, device)
}

fn save_split(path: &Path, dataset: &EncodedDataset) -> Result<()> {
    let n = dataset.len();
    let max_length = dataset.max_length();

    let ids: Vec<u8> = dataset
        .input_ids
        .flatten_all()?
        .to_vec1::<u32>()?
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let mask: Vec<u8> = dataset
        .attention_mask
        .flatten_all()?
        .to_vec1::<u32>()?
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let labels: Vec<u8> = dataset
        .labels
        .to_vec1::<i64>()?
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();

    let mut tensors = HashMap::new();
    tensors.insert(
        "input_ids".to_string(),
        tensor_view(Dtype::U32, vec![n, max_length], &ids)?,
    );
    tensors.insert(
        "attention_mask".to_string(),
        tensor_view(Dtype::U32, vec![n, max_length], &mask)?,
    );
    tensors.insert("labels".to_string(), tensor_view(Dtype::I64, vec![n], &labels)?);

    let serialized = safetensors::tensor::serialize(&tensors, &None)
        .map_err(|e| AdvRegError::Data(format!("serialize: {e}")))?;
    std::fs::write(path, serialized)
        .map_err(|e| AdvRegError::Data(format!("Failed to write {}: {e}", path.display())))
}

fn tensor_view(dtype: Dtype, shape: Vec<usize>, bytes: &[u8]) -> Result<TensorView<'_>> {
    TensorView::new(dtype, shape, bytes)
        .map_err(|e| AdvRegError::Data(format!("TensorView create failed: {e}")))
}
