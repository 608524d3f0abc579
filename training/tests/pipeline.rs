//! Precompute, train, checkpoint and evaluate on tiny on-disk review domains.

use std::path::Path;

use advreg_core::{AdversarialConfig, ModelConfig, RunConfig, StrategyKind, TrainingConfig};
use advreg_training::checkpoint::{CheckpointKey, CheckpointStore, DirectoryCheckpointStore};
use advreg_training::data::load_tokenizer;
use advreg_training::precompute::{self, Split};
use advreg_training::trainer;
use candle_core::Device;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "WhitespaceSplit"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "[PAD]": 0, "[UNK]": 1, "great": 2, "love": 3, "fine": 4,
      "okay": 5, "awful": 6, "hate": 7, "book": 8, "phone": 9, "it": 10
    },
    "unk_token": "[UNK]"
  }
}"#;

fn write_domain(root: &Path, domain: &str, noun: &str, with_val: bool) {
    let dir = root.join(domain);
    std::fs::create_dir_all(&dir).unwrap();
    let phrases = [("awful", 0), ("hate", 0), ("fine", 1), ("okay", 1), ("great", 2), ("love", 2)];
    let mut lines = Vec::new();
    for i in 0..4 {
        for (word, label) in phrases {
            let text = if i % 2 == 0 {
                format!("{word} {noun}")
            } else {
                format!("{noun} {word} it")
            };
            lines.push(serde_json::json!({"text": text, "label": label}).to_string());
        }
    }
    std::fs::write(dir.join("train.jsonl"), lines.join("\n")).unwrap();
    if with_val {
        std::fs::write(dir.join("val.jsonl"), lines[..6].join("\n")).unwrap();
    }
}

fn config(ckpt_dir: &Path, strategy: StrategyKind) -> RunConfig {
    RunConfig {
        model: ModelConfig {
            vocab_size: 11,
            hidden_dim: 8,
            num_labels: 3,
        },
        training: TrainingConfig {
            lr: 5e-2,
            batch_size: 4,
            epochs: 2,
            max_length: 4,
            warmup_ratio: 0.0,
            device: "cpu".to_string(),
            ckpt_dir: ckpt_dir.display().to_string(),
            log_every: 0,
            ..Default::default()
        },
        adversarial: AdversarialConfig {
            strategy,
            steps: 2,
            step_size: 1e-3,
            ..Default::default()
        },
    }
}

#[test]
fn test_in_domain_pipeline_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let cache_dir = tmp.path().join("cache");
    let ckpt_dir = tmp.path().join("ckpt");
    write_domain(&data_dir, "book", "book", false);
    let tokenizer_path = tmp.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();

    let tokenizer = load_tokenizer(&tokenizer_path).unwrap();
    let manifest =
        precompute::precompute(&tokenizer, &data_dir, "book", &cache_dir, 4, 0.25, 42).unwrap();
    assert_eq!(manifest.num_labels, 3);
    // 24 samples, 8 per class, 2 per class held out.
    assert_eq!(manifest.entry(Split::Val).unwrap().samples, 6);
    assert_eq!(manifest.entry(Split::Train).unwrap().samples, 18);

    let cfg = config(&ckpt_dir, StrategyKind::Smart);
    let report = trainer::train_in_domain(&cfg, &cache_dir, "book", &Device::Cpu).unwrap();
    assert_eq!(report.epochs.len(), 2);
    assert!(report.epochs[0].saved);
    assert!(report
        .epochs
        .iter()
        .all(|e| e.train.mean_total_loss.is_finite()));

    let store = DirectoryCheckpointStore::new(&ckpt_dir);
    let key = CheckpointKey::in_domain("book");
    assert!(store.weights_path(&key).exists());
    let record = store.record(&key).unwrap().unwrap();
    assert_eq!(Some(record.epoch), report.best_epoch);
    assert!((record.accuracy - report.best_accuracy).abs() < 1e-12);

    let score = trainer::evaluate_checkpoint(
        &cfg,
        &store.weights_path(&key),
        &cache_dir,
        "book",
        Split::Val,
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(score.total, 6);
    assert!((score.accuracy - report.best_accuracy).abs() < 1e-12);
}

#[test]
fn test_single_source_pipeline_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let cache_dir = tmp.path().join("cache");
    let ckpt_dir = tmp.path().join("ckpt");
    write_domain(&data_dir, "electronics", "phone", true);
    write_domain(&data_dir, "book", "book", true);
    let tokenizer_path = tmp.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();
    let tokenizer = load_tokenizer(&tokenizer_path).unwrap();

    for domain in ["electronics", "book"] {
        precompute::precompute(&tokenizer, &data_dir, domain, &cache_dir, 4, 0.2, 7).unwrap();
    }

    let cfg = config(&ckpt_dir, StrategyKind::FreeLb);
    let report =
        trainer::train_single_source(&cfg, &cache_dir, "electronics", "book", &Device::Cpu)
            .unwrap();

    assert!(report.target_accuracy.is_some());
    assert!(report.epochs.iter().all(|e| e.target.is_some()));
    let store = DirectoryCheckpointStore::new(&ckpt_dir);
    assert!(store
        .weights_path(&CheckpointKey::transfer("electronics", "book"))
        .exists());
}

#[test]
fn test_train_rejects_domain_with_too_many_labels() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let cache_dir = tmp.path().join("cache");
    write_domain(&data_dir, "music", "book", false);
    let tokenizer_path = tmp.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();
    let tokenizer = load_tokenizer(&tokenizer_path).unwrap();
    precompute::precompute(&tokenizer, &data_dir, "music", &cache_dir, 4, 0.2, 1).unwrap();

    let mut cfg = config(&tmp.path().join("ckpt"), StrategyKind::Smart);
    cfg.model.num_labels = 2;
    assert!(trainer::train_in_domain(&cfg, &cache_dir, "music", &Device::Cpu).is_err());
}

#[test]
fn test_train_rejects_tokenizer_larger_than_model_vocabulary() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let cache_dir = tmp.path().join("cache");
    write_domain(&data_dir, "beauty", "book", false);
    let tokenizer_path = tmp.path().join("tokenizer.json");
    std::fs::write(&tokenizer_path, TOKENIZER_JSON).unwrap();
    let tokenizer = load_tokenizer(&tokenizer_path).unwrap();
    let manifest =
        precompute::precompute(&tokenizer, &data_dir, "beauty", &cache_dir, 4, 0.2, 1).unwrap();
    assert_eq!(manifest.vocab_size, 11);

    let mut cfg = config(&tmp.path().join("ckpt"), StrategyKind::Smart);
    cfg.model.vocab_size = 8;
    let err = trainer::train_in_domain(&cfg, &cache_dir, "beauty", &Device::Cpu).unwrap_err();
    assert!(err.to_string().contains("vocabulary"));
}
