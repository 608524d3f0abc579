//! Epoch loop for adversarially regularized training with best-checkpointing.
//!
//! Two run shapes are supported:
//! - **in-domain**: train and validate on one domain, checkpoint key `<domain>`
//! - **single-source transfer**: train and validate on a source domain, score
//!   a target domain every epoch, checkpoint key `<source>-<target>`. The
//!   reported target accuracy is the one at the best source epoch.

use std::path::Path;

use advreg_core::{AdvRegError, Result, RunConfig};
use advreg_engine::{
    build_optimizer, build_strategy, EpochSummary, LinearSchedule, PooledClassifier,
    SequenceClassifier, TrainingStep,
};
use candle_core::Device;

use crate::checkpoint::{BestCheckpoint, CheckpointKey, CheckpointStore, DirectoryCheckpointStore};
use crate::data::{BatchIterator, EncodedDataset};
use crate::evaluation::evaluate;
use crate::metrics::AccuracyScore;
use crate::precompute::{load_manifest, load_split, Split};

/// Encoded splits a run trains and scores on.
#[derive(Debug, Clone)]
pub struct RunData {
    pub train: EncodedDataset,
    /// Drives checkpointing.
    pub val: EncodedDataset,
    /// Scored every epoch in transfer runs.
    pub target: Option<EncodedDataset>,
}

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// 1-based.
    pub epoch: usize,
    pub train: EpochSummary,
    pub val: AccuracyScore,
    pub target: Option<AccuracyScore>,
    /// Whether this epoch's weights were checkpointed.
    pub saved: bool,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub key: CheckpointKey,
    pub epochs: Vec<EpochReport>,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    /// Target accuracy at the best validation epoch (transfer runs only).
    pub target_accuracy: Option<f64>,
}

/// Train `model` on `data` for the configured number of epochs.
pub fn train_run(
    config: &RunConfig,
    model: &PooledClassifier,
    data: &RunData,
    key: CheckpointKey,
    store: &mut dyn CheckpointStore,
) -> Result<RunReport> {
    let training = &config.training;
    if data.train.is_empty() {
        return Err(AdvRegError::Data("training split is empty".to_string()));
    }

    let steps_per_epoch = data.train.len().div_ceil(training.batch_size);
    let total_steps = steps_per_epoch * training.epochs;
    let optimizer = build_optimizer(model.parameters(), training)?;
    let schedule = LinearSchedule::new(training.lr, training.warmup_ratio, total_steps);
    let mut step = TrainingStep::new(
        build_strategy(&config.adversarial),
        optimizer,
        schedule,
        training.seed,
    )
    .with_log_every(training.log_every);

    let mut best = BestCheckpoint::new(key.clone());
    let mut target_accuracy = None;
    let mut epochs = Vec::with_capacity(training.epochs);

    println!(
        "\nTraining {}: strategy={} lr={} batch={} epochs={} adv_steps={} norm={} max_norm={}",
        key,
        config.adversarial.strategy,
        training.lr,
        training.batch_size,
        training.epochs,
        config.adversarial.steps,
        config.adversarial.norm_type,
        config.adversarial.max_norm,
    );
    println!("{:-<80}", "");

    for epoch in 0..training.epochs {
        let mut batches = BatchIterator::new(&data.train, training.batch_size);
        batches.reshuffle(training.seed, epoch);
        let summary = step.run_epoch(model, batches)?;

        let val = evaluate(model, BatchIterator::new(&data.val, training.batch_size))?;
        let target = match &data.target {
            Some(target) => Some(evaluate(
                model,
                BatchIterator::new(target, training.batch_size),
            )?),
            None => None,
        };

        let saved = best.observe(epoch + 1, val.accuracy, model.varmap(), store)?;
        if saved {
            target_accuracy = target.as_ref().map(|t| t.accuracy);
        }

        let marker = if saved { "*" } else { "" };
        match &target {
            Some(t) => println!(
                "  epoch {:3} | {} | val {} {} | target {}",
                epoch + 1,
                summary,
                val,
                marker,
                t
            ),
            None => println!("  epoch {:3} | {} | val {} {}", epoch + 1, summary, val, marker),
        }

        epochs.push(EpochReport {
            epoch: epoch + 1,
            train: summary,
            val,
            target,
            saved,
        });
    }

    println!("{:-<80}", "");
    println!("Best val accuracy: {:.4}", best.best_accuracy());
    if let Some(acc) = target_accuracy {
        println!("Target accuracy at best epoch: {acc:.4}");
    }

    Ok(RunReport {
        key,
        epochs,
        best_accuracy: best.best_accuracy(),
        best_epoch: best.best_epoch(),
        target_accuracy,
    })
}

/// Reject a cache whose labels or token ids do not fit the configured model.
fn check_cache(config: &RunConfig, cache_dir: &Path, domain: &str) -> Result<()> {
    let manifest = load_manifest(cache_dir, domain)?;
    if manifest.num_labels > config.model.num_labels {
        return Err(AdvRegError::Config(format!(
            "domain '{domain}' has {} labels but the model is configured for {}",
            manifest.num_labels, config.model.num_labels
        )));
    }
    if manifest.vocab_size > config.model.vocab_size {
        return Err(AdvRegError::Config(format!(
            "domain '{domain}' was encoded with a vocabulary of {} but the model is configured for {}",
            manifest.vocab_size, config.model.vocab_size
        )));
    }
    Ok(())
}

/// Train and validate on one cached domain; checkpoints go to `ckpt_dir/<domain>`.
pub fn train_in_domain(
    config: &RunConfig,
    cache_dir: &Path,
    domain: &str,
    device: &Device,
) -> Result<RunReport> {
    check_cache(config, cache_dir, domain)?;
    let data = RunData {
        train: load_split(cache_dir, domain, Split::Train, device)?,
        val: load_split(cache_dir, domain, Split::Val, device)?,
        target: None,
    };
    let model = PooledClassifier::seeded(&config.model, device, config.training.seed)?;
    let mut store = DirectoryCheckpointStore::new(&config.training.ckpt_dir);
    train_run(
        config,
        &model,
        &data,
        CheckpointKey::in_domain(domain),
        &mut store,
    )
}

/// Train on `source`, checkpoint on its validation split, and score `target`.
///
/// The target is scored on its cached test split when one exists, otherwise
/// on its whole labeled training split.
pub fn train_single_source(
    config: &RunConfig,
    cache_dir: &Path,
    source: &str,
    target: &str,
    device: &Device,
) -> Result<RunReport> {
    check_cache(config, cache_dir, source)?;
    check_cache(config, cache_dir, target)?;
    let target_split = if load_manifest(cache_dir, target)?.entry(Split::Test).is_some() {
        Split::Test
    } else {
        Split::Train
    };
    let data = RunData {
        train: load_split(cache_dir, source, Split::Train, device)?,
        val: load_split(cache_dir, source, Split::Val, device)?,
        target: Some(load_split(cache_dir, target, target_split, device)?),
    };
    let model = PooledClassifier::seeded(&config.model, device, config.training.seed)?;
    let mut store = DirectoryCheckpointStore::new(&config.training.ckpt_dir);
    train_run(
        config,
        &model,
        &data,
        CheckpointKey::transfer(source, target),
        &mut store,
    )
}

/// Load a saved classifier and score it on a cached split.
pub fn evaluate_checkpoint(
    config: &RunConfig,
    weights: &Path,
    cache_dir: &Path,
    domain: &str,
    split: Split,
    device: &Device,
) -> Result<AccuracyScore> {
    let model = PooledClassifier::load(weights, &config.model, device)?;
    let dataset = load_split(cache_dir, domain, split, device)?;
    evaluate(&model, BatchIterator::new(&dataset, config.training.batch_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointRecord;
    use advreg_core::{AdversarialConfig, ModelConfig, TrainingConfig};
    use candle_nn::VarMap;

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

    fn dataset(n: usize, device: &Device) -> EncodedDataset {
        // Label is decided by the first token: ids 1..=3 map to labels 0..=2.
        let mut ids = Vec::new();
        let mut mask = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let label = (i % 3) as u32;
            ids.extend([label + 1, 4 + (i % 2) as u32, 0]);
            mask.extend([1u32, 1, 0]);
            labels.push(label as i64);
        }
        EncodedDataset::from_parts(ids, mask, labels, 3, device).unwrap()
    }

    fn config(epochs: usize) -> RunConfig {
        RunConfig {
            model: ModelConfig {
                vocab_size: 8,
                hidden_dim: 8,
                num_labels: 3,
            },
            training: TrainingConfig {
                lr: 5e-2,
                batch_size: 4,
                epochs,
                warmup_ratio: 0.0,
                log_every: 0,
                ..Default::default()
            },
            adversarial: AdversarialConfig::default(),
        }
    }

    #[test]
    fn test_train_run_reports_every_epoch() {
        let device = Device::Cpu;
        let cfg = config(3);
        let model = PooledClassifier::seeded(&cfg.model, &device, cfg.training.seed).unwrap();
        let data = RunData {
            train: dataset(12, &device),
            val: dataset(6, &device),
            target: None,
        };
        let mut store = RecordingStore::default();
        let report = train_run(&cfg, &model, &data, CheckpointKey::in_domain("book"), &mut store)
            .unwrap();

        assert_eq!(report.epochs.len(), 3);
        assert!(report.target_accuracy.is_none());
        assert_eq!(report.epochs[0].train.applied, 3);
        // The first epoch always saves since the best starts at 0.
        assert!(report.epochs[0].saved);
        let saves = report.epochs.iter().filter(|e| e.saved).count();
        assert_eq!(store.writes.len(), saves);
        assert_eq!(report.best_epoch, store.writes.last().map(|r| r.epoch));
    }

    #[test]
    fn test_transfer_run_reports_target_at_best_epoch() {
        let device = Device::Cpu;
        let cfg = config(2);
        let model = PooledClassifier::seeded(&cfg.model, &device, cfg.training.seed).unwrap();
        let data = RunData {
            train: dataset(8, &device),
            val: dataset(3, &device),
            target: Some(dataset(5, &device)),
        };
        let mut store = RecordingStore::default();
        let report = train_run(
            &cfg,
            &model,
            &data,
            CheckpointKey::transfer("electronics", "book"),
            &mut store,
        )
        .unwrap();

        let best_epoch = report.best_epoch.unwrap();
        let at_best = report.epochs[best_epoch - 1].target.as_ref().unwrap().accuracy;
        assert_eq!(report.target_accuracy, Some(at_best));
        assert_eq!(store.writes[0].key, "electronics-book");
    }

    #[test]
    fn test_check_cache_rejects_oversized_vocabulary() {
        use crate::data::{DomainSplits, ReviewSample, TokenEncoder};
        use crate::precompute::write_cache;

        struct WideEncoder;

        impl TokenEncoder for WideEncoder {
            fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
                Ok(text.bytes().map(|b| u32::from(b % 7) + 1).collect())
            }

            fn vocab_size(&self) -> Option<usize> {
                Some(70)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let sample = |text: &str, label| ReviewSample {
            text: text.to_string(),
            label,
        };
        let splits = DomainSplits {
            domain: "music".to_string(),
            train: vec![sample("loud", 0), sample("soft", 1), sample("fine", 2)],
            val: vec![sample("ok", 1)],
            test: None,
        };
        write_cache(&WideEncoder, &splits, dir.path(), 4).unwrap();

        let mut cfg = config(1);
        cfg.model.vocab_size = 64;
        let err = check_cache(&cfg, dir.path(), "music").unwrap_err();
        assert!(matches!(err, AdvRegError::Config(_)));
        assert!(err.to_string().contains("70"));

        cfg.model.vocab_size = 70;
        assert!(check_cache(&cfg, dir.path(), "music").is_ok());
        let err = train_in_domain(&config(1), dir.path(), "music", &Device::Cpu).unwrap_err();
        assert!(matches!(err, AdvRegError::Config(_)));
    }

    #[test]
    fn test_train_run_rejects_empty_train_split() {
        let device = Device::Cpu;
        let cfg = config(1);
        let model = PooledClassifier::seeded(&cfg.model, &device, cfg.training.seed).unwrap();
        let data = RunData {
            train: dataset(0, &device),
            val: dataset(3, &device),
            target: None,
        };
        let mut store = RecordingStore::default();
        assert!(train_run(&cfg, &model, &data, CheckpointKey::in_domain("x"), &mut store).is_err());
    }
}
