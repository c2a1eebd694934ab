//! # edgequake-docbatch
//!
//! Batch conversion of documents (PDFs, scans, photos, text) to Markdown
//! with Vision Language Models, with quality scoring and adaptive retries.
//!
//! ## Why this crate?
//!
//! Converting one clean PDF with one model is easy. Converting a folder of
//! mixed scans, forms and photos is not: some files need a stronger model,
//! some time out, and some come back as plausible-looking garbage. This crate
//! runs a whole batch through a bounded worker pool, scores every result
//! heuristically, and retries below-threshold files with a stronger profile
//! (or fallback settings) before accepting the best attempt.
//!
//! ## Architecture
//!
//! ```text
//! files ─► BatchEngine ─► worker pool ─► TaskExecutor (VlmExecutor)
//!             │               │               │
//!             │               │               └─ pdfium render → encode → VLM → polish
//!             │               ├─ QualityAnalyzer  score 0–1 + recommendations
//!             │               └─ ConfigManager    profile choice, escalation, fallback
//!             └─ JobStatus / JobResults / JobEvent stream
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docbatch::{BatchEngine, ConfigManager, FileRef, JobSettings, VlmExecutor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(ConfigManager::default());
//!     let executor = Arc::new(VlmExecutor::from_config(&config.snapshot()));
//!     let engine = BatchEngine::new(config);
//!
//!     let files = vec![FileRef::path("invoice.pdf"), FileRef::path("scan.png")];
//!     let job = engine
//!         .create_batch_job(files, JobSettings::builder().max_workers(2).build()?)
//!         .await?;
//!     engine.start_batch_processing(job, executor)?;
//!     engine.wait_for_job(job).await?;
//!
//!     for (file, outcome) in engine.get_job_results(job)?.results {
//!         println!("{file}: {}", outcome.text().unwrap_or("<failed>"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docbatch` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docbatch = { version = "0.1", default-features = false }
//! ```
//!
//! ## Default Profiles
//!
//! | Profile | Backend | Class | Strengths |
//! |---------|---------|-------|-----------|
//! | `llama3.2-vision` | Ollama | standard | text, tables, scans |
//! | `minicpm-v` | Ollama | light | photos, large documents |
//! | `llava-13b` | Ollama | heavy | handwriting, photos |
//! | `gpt-4.1` | OpenAI | heavy | forms, tables, handwriting |
//!
//! Escalation only ever moves to a strictly heavier class.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod prompts;
pub mod quality;
pub mod registry;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{
    BatchEngine, BatchEngineBuilder, EventStream, JobEvent, JobId, JobResults, JobSettings,
    JobState, JobStatus, TaskOutcome, TaskState,
};
pub use config::{ConfigDocument, ConfigManager, OutputFormat, Strategy};
pub use error::{BatchError, ConfigError, ExecutorError, TaskError};
pub use executor::{ConvertOutput, ConvertRequest, ResultCache, TaskExecutor, VlmExecutor};
pub use history::PerformanceHistory;
pub use quality::{QualityAnalyzer, QualityAssessor};
pub use registry::{ModelProfile, ResourceClass};
pub use types::{
    CapabilityTag, FileCharacteristics, FileRef, FileType, ProcessingInfo, ProcessingSettings,
    QualityMetrics,
};
