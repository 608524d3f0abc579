//! Best-so-far checkpointing.
//!
//! A checkpoint is keyed by domain (in-domain runs) or by a source-target
//! pair (transfer runs). Saving overwrites the previous checkpoint under the
//! same key; there is no versioning beyond "best so far".

use std::fmt;
use std::path::{Path, PathBuf};

use advreg_core::{AdvRegError, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// Name a checkpoint is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckpointKey {
    InDomain(String),
    Transfer { source: String, target: String },
}

impl CheckpointKey {
    pub fn in_domain(domain: impl Into<String>) -> Self {
        Self::InDomain(domain.into())
    }

    pub fn transfer(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Transfer {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InDomain(domain) => f.write_str(domain),
            Self::Transfer { source, target } => write!(f, "{source}-{target}"),
        }
    }
}

/// Metadata written next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub key: String,
    /// 1-based epoch the weights come from.
    pub epoch: usize,
    pub accuracy: f64,
}

/// Persists model parameters under a key.
pub trait CheckpointStore {
    /// Write (overwriting) the parameters and record for `key`.
    fn save(&mut self, key: &CheckpointKey, params: &VarMap, record: &CheckpointRecord)
        -> Result<()>;

    /// Record of the checkpoint under `key`, if one exists.
    fn record(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>>;
}

/// Stores `<root>/<key>.safetensors` plus a `<root>/<key>.json` sidecar.
#[derive(Debug, Clone)]
pub struct DirectoryCheckpointStore {
    root: PathBuf,
}

impl DirectoryCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights_path(&self, key: &CheckpointKey) -> PathBuf {
        self.root.join(format!("{key}.safetensors"))
    }

    pub fn record_path(&self, key: &CheckpointKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl CheckpointStore for DirectoryCheckpointStore {
    fn save(
        &mut self,
        key: &CheckpointKey,
        params: &VarMap,
        record: &CheckpointRecord,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            AdvRegError::Checkpoint(format!("mkdir {} failed: {e}", self.root.display()))
        })?;
        let weights = self.weights_path(key);
        params.save(&weights).map_err(|e| {
            AdvRegError::Checkpoint(format!("Failed to save {}: {e}", weights.display()))
        })?;
        std::fs::write(self.record_path(key), serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn record(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Tracks the best accuracy of a run and saves whenever it is matched or beaten.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    key: CheckpointKey,
    best_accuracy: f64,
    best_epoch: Option<usize>,
}

impl BestCheckpoint {
    pub fn new(key: CheckpointKey) -> Self {
        Self {
            key,
            best_accuracy: 0.0,
            best_epoch: None,
        }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Save `params` if `accuracy >= best`. Returns whether a save happened.
    pub fn observe(
        &mut self,
        epoch: usize,
        accuracy: f64,
        params: &VarMap,
        store: &mut dyn CheckpointStore,
    ) -> Result<bool> {
        if accuracy < self.best_accuracy {
            return Ok(false);
        }
        self.best_accuracy = accuracy;
        self.best_epoch = Some(epoch);
        let record = CheckpointRecord {
            key: self.key.to_string(),
            epoch,
            accuracy,
        };
        store.save(&self.key, params, &record)?;
        tracing::info!(key = %self.key, epoch, accuracy, "checkpoint saved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Counts writes instead of touching the filesystem.
    #[derive(Default)]
    struct RecordingStore {
        writes: Vec<CheckpointRecord>,
    }

    impl CheckpointStore for RecordingStore {
        fn save(&mut self, _: &CheckpointKey, _: &VarMap, record: &CheckpointRecord) -> Result<()> {
            self.writes.push(record.clone());
            Ok(())
        }

        fn record(&self, _: &CheckpointKey) -> Result<Option<CheckpointRecord>> {
            Ok(self.writes.last().cloned())
        }
    }

    fn varmap() -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "w", candle_nn::Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CheckpointKey::in_domain("book").to_string(), "book");
        assert_eq!(
            CheckpointKey::transfer("electronics", "book").to_string(),
            "electronics-book"
        );
    }

    #[test]
    fn test_worse_second_epoch_keeps_first_checkpoint() {
        let mut store = RecordingStore::default();
        let mut best = BestCheckpoint::new(CheckpointKey::in_domain("book"));
        let params = varmap();

        assert!(best.observe(1, 0.72, &params, &mut store).unwrap());
        assert!(!best.observe(2, 0.65, &params, &mut store).unwrap());

        assert_eq!(store.writes.len(), 1);
        assert_eq!(store.writes[0].epoch, 1);
        assert_eq!(best.best_epoch(), Some(1));
        assert!((best.best_accuracy() - 0.72).abs() < 1e-12);
    }

    #[test]
    fn test_equal_accuracy_overwrites() {
        let mut store = RecordingStore::default();
        let mut best = BestCheckpoint::new(CheckpointKey::in_domain("music"));
        let params = varmap();

        best.observe(1, 0.5, &params, &mut store).unwrap();
        assert!(best.observe(2, 0.5, &params, &mut store).unwrap());
        assert_eq!(store.writes.len(), 2);
        assert_eq!(best.best_epoch(), Some(2));
    }

    #[test]
    fn test_zero_accuracy_still_saves_first_epoch() {
        let mut store = RecordingStore::default();
        let mut best = BestCheckpoint::new(CheckpointKey::in_domain("beauty"));
        assert!(best.observe(1, 0.0, &varmap(), &mut store).unwrap());
    }

    #[test]
    fn test_directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryCheckpointStore::new(dir.path().join("ckpt"));
        let key = CheckpointKey::transfer("electronics", "book");
        assert!(store.record(&key).unwrap().is_none());

        let params = varmap();
        let record = CheckpointRecord {
            key: key.to_string(),
            epoch: 3,
            accuracy: 0.81,
        };
        store.save(&key, &params, &record).unwrap();

        assert!(store.weights_path(&key).exists());
        assert!(store
            .weights_path(&key)
            .ends_with("electronics-book.safetensors"));
        assert_eq!(store.record(&key).unwrap(), Some(record));

        let mut reloaded = VarMap::new();
        reloaded
            .get((2, 3), "w", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        reloaded.load(store.weights_path(&key)).unwrap();
        let w: Vec<Vec<f32>> = reloaded.all_vars()[0].as_tensor().to_vec2().unwrap();
        assert_eq!(w[0], vec![0.5, 0.5, 0.5]);
    }
}
