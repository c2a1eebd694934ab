//! Conversion collaborator: the seam between the batch engine and whatever
//! actually turns a file into text.
//!
//! The engine only ever sees [`TaskExecutor`]. It enforces the per-call
//! timeout itself, classifies the returned [`ExecutorError`] as transient or
//! permanent, and scores the returned text. [`VlmExecutor`] is the shipped
//! implementation: pdfium rendering plus a vision model through
//! `edgequake-llm`. Tests substitute scripted executors.
//!
//! ## Stages inside `VlmExecutor`
//!
//! 1. [`render`]: rasterise PDF pages (and read their text layer for hybrid
//!    OCR) in `spawn_blocking`; decode image files.
//! 2. [`encode`]: resize to the profile's image cap, JPEG or PNG, base64.
//! 3. vision call per page through the profile's provider and model.
//! 4. [`postprocess`]: deterministic markdown cleanup.
//! 5. [`cache`]: optional result cache keyed by content hash.

pub mod cache;
pub mod encode;
pub mod postprocess;
pub mod render;
mod vlm;

pub use cache::ResultCache;
pub use vlm::VlmExecutor;

use crate::error::ExecutorError;
use crate::registry::ModelProfile;
use crate::types::{FileRef, FileType, ProcessingInfo, ProcessingSettings};
use async_trait::async_trait;
use std::time::Duration;

/// Everything the collaborator needs for one attempt.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub file: FileRef,
    pub file_type: FileType,
    /// Snapshot of the profile named by `settings.profile`.
    pub profile: ModelProfile,
    pub settings: ProcessingSettings,
    /// Deadline the engine will enforce. Informational for the executor.
    pub timeout: Duration,
    /// 1-based attempt number within the task.
    pub attempt: u32,
}

/// Successful result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOutput {
    pub extracted_text: String,
    pub info: ProcessingInfo,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Convert one file. Errors must be classified: `Timeout`/`Transport`
    /// are retried, `Unavailable`/`Unsupported` fail the task.
    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutput, ExecutorError>;

    /// Whether the backend for `profile` can take calls right now.
    /// Checked once per attempt before `convert`.
    async fn is_available(&self, _profile_name: &str, _profile: &ModelProfile) -> bool {
        true
    }
}
