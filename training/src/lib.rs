//! Training pipeline for adversarially regularized review classification
//!
//! Loads review domains from JSONL, tokenizes them once into a safetensors
//! cache, and drives epochs of adversarial training with per-epoch
//! evaluation and best-so-far checkpointing.
//!
//! # Modules
//!
//! - [`data`] — JSONL loading, stratified splits, tokenization, batch iteration
//! - [`precompute`] — safetensors cache of encoded splits plus manifest
//! - [`metrics`] — accuracy / macro-F1 aggregation
//! - [`checkpoint`] — keyed checkpoint store and best-accuracy tracking
//! - [`evaluation`] — clean-forward evaluation loop
//! - [`trainer`] — in-domain and single-source transfer runs

pub mod checkpoint;
pub mod data;
pub mod evaluation;
pub mod metrics;
pub mod precompute;
pub mod trainer;

pub use checkpoint::{BestCheckpoint, CheckpointKey, CheckpointStore, DirectoryCheckpointStore};
pub use data::{BatchIterator, EncodedDataset, ReviewSample, TokenEncoder};
pub use evaluation::evaluate;
pub use metrics::{AccuracyMetric, AccuracyScore};
pub use trainer::{train_in_domain, train_run, train_single_source, RunData, RunReport};
