//! CLI entry point for the adversarial training pipeline.
//!
//! Subcommands:
//!   precompute  -- Tokenize a review domain and cache it as safetensors
//!   train       -- Train in-domain, or source -> target with `--target`
//!   evaluate    -- Score a saved checkpoint on a cached split

use std::path::{Path, PathBuf};

use advreg_core::{parse_config, NormType, RunConfig, StrategyKind};
use advreg_engine::resolve_device;
use advreg_training::checkpoint::{CheckpointKey, DirectoryCheckpointStore};
use advreg_training::data::{load_tokenizer, DEFAULT_VAL_RATIO};
use advreg_training::precompute::{self, Split};
use advreg_training::trainer;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "train-adv", about = "Adversarially regularized review classifier training")]
struct Cli {
    /// YAML run configuration; every field is optional.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tokenize a domain and write its tensor cache.
    Precompute {
        /// Directory containing one sub-directory per domain.
        #[arg(long)]
        data_dir: PathBuf,

        /// Domain to encode (e.g. book, electronics, beauty, music).
        #[arg(long)]
        domain: String,

        /// Path to tokenizer.json.
        #[arg(long)]
        tokenizer: PathBuf,

        /// Output directory for cached tensors.
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,

        /// Validation fraction used when the domain has no val.jsonl.
        #[arg(long, default_value_t = DEFAULT_VAL_RATIO)]
        val_ratio: f64,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Train on a cached domain.
    Train {
        /// Directory of precomputed caches.
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,

        /// Source (or in-domain) domain.
        #[arg(long)]
        domain: String,

        /// Target domain for a single-source transfer run.
        #[arg(long)]
        target: Option<String>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Score the best checkpoint of a run on a cached split.
    Evaluate {
        /// Directory of precomputed caches.
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,

        /// Domain whose split is scored.
        #[arg(long)]
        domain: String,

        /// Split to score: train, val or test.
        #[arg(long, default_value = "val")]
        split: Split,

        /// Checkpoint key, e.g. `book` or `electronics-book`; defaults to the domain.
        #[arg(long)]
        checkpoint: Option<String>,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Individual fields overriding the YAML configuration.
#[derive(Args, Default)]
struct Overrides {
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    max_length: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// auto, cpu, cuda:N or metal:N.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    ckpt_dir: Option<String>,
    /// smart, vat or freelb.
    #[arg(long)]
    strategy: Option<StrategyKind>,
    #[arg(long)]
    adv_steps: Option<usize>,
    #[arg(long)]
    adv_lr: Option<f64>,
    #[arg(long)]
    adv_init_mag: Option<f64>,
    #[arg(long)]
    adv_noise_var: Option<f64>,
    #[arg(long)]
    adv_max_norm: Option<f64>,
    /// l1, l2 or linf.
    #[arg(long)]
    norm_type: Option<NormType>,
    #[arg(long)]
    adv_alpha: Option<f64>,
}

impl Overrides {
    fn apply(&self, config: &mut RunConfig) {
        let training = &mut config.training;
        if let Some(v) = self.lr {
            training.lr = v;
        }
        if let Some(v) = self.batch_size {
            training.batch_size = v;
        }
        if let Some(v) = self.epochs {
            training.epochs = v;
        }
        if let Some(v) = self.max_length {
            training.max_length = v;
        }
        if let Some(v) = self.seed {
            training.seed = v;
        }
        if let Some(v) = &self.device {
            training.device = v.clone();
        }
        if let Some(v) = &self.ckpt_dir {
            training.ckpt_dir = v.clone();
        }

        let adversarial = &mut config.adversarial;
        if let Some(v) = self.strategy {
            adversarial.strategy = v;
        }
        if let Some(v) = self.adv_steps {
            adversarial.steps = v;
        }
        if let Some(v) = self.adv_lr {
            adversarial.step_size = v;
        }
        if let Some(v) = self.adv_init_mag {
            adversarial.init_mag = v;
        }
        if let Some(v) = self.adv_noise_var {
            adversarial.noise_var = v;
        }
        if let Some(v) = self.adv_max_norm {
            adversarial.max_norm = v;
        }
        if let Some(v) = self.norm_type {
            adversarial.norm_type = v;
        }
        if let Some(v) = self.adv_alpha {
            adversarial.alpha = v;
        }
    }
}

/// YAML (or defaults), then overrides, then a single validation pass.
fn resolve_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<RunConfig> {
    let mut config = match path {
        Some(path) => parse_config(path)?,
        None => RunConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Precompute {
            data_dir,
            domain,
            tokenizer,
            cache_dir,
            val_ratio,
            overrides,
        } => {
            let config = resolve_config(config_path, &overrides)?;
            let tokenizer = load_tokenizer(&tokenizer)?;
            precompute::precompute(
                &tokenizer,
                &data_dir,
                &domain,
                &cache_dir,
                config.training.max_length,
                val_ratio,
                config.training.seed,
            )
            .with_context(|| format!("precompute failed for domain '{domain}'"))?;
        }

        Command::Train {
            cache_dir,
            domain,
            target,
            overrides,
        } => {
            let config = resolve_config(config_path, &overrides)?;
            let device = resolve_device(&config.training.device)?;
            let report = match &target {
                Some(target) => {
                    trainer::train_single_source(&config, &cache_dir, &domain, target, &device)?
                }
                None => trainer::train_in_domain(&config, &cache_dir, &domain, &device)?,
            };
            match report.target_accuracy {
                Some(t_acc) => println!(
                    "\n{}: best val {:.4} (epoch {}), target {:.4}",
                    report.key,
                    report.best_accuracy,
                    report.best_epoch.unwrap_or_default(),
                    t_acc
                ),
                None => println!(
                    "\n{}: best val {:.4} (epoch {})",
                    report.key,
                    report.best_accuracy,
                    report.best_epoch.unwrap_or_default()
                ),
            }
        }

        Command::Evaluate {
            cache_dir,
            domain,
            split,
            checkpoint,
            overrides,
        } => {
            let config = resolve_config(config_path, &overrides)?;
            let device = resolve_device(&config.training.device)?;
            let key = match checkpoint {
                Some(name) => match name.split_once('-') {
                    Some((source, target)) => CheckpointKey::transfer(source, target),
                    None => CheckpointKey::in_domain(name),
                },
                None => CheckpointKey::in_domain(domain.clone()),
            };
            let store = DirectoryCheckpointStore::new(&config.training.ckpt_dir);
            let weights = store.weights_path(&key);
            let score = trainer::evaluate_checkpoint(
                &config, &weights, &cache_dir, &domain, split, &device,
            )
            .with_context(|| format!("evaluation of checkpoint '{key}' failed"))?;
            println!("{key} on {domain}/{}: {score}", split.name());
        }
    }

    Ok(())
}
