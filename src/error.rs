//! Error types for the edgequake-docbatch library.
//!
//! Four error types reflect four distinct failure scopes:
//!
//! * [`BatchError`]: **Caller misuse** of the job-control surface (empty
//!   file list, unknown job id, starting a job twice). Returned synchronously
//!   from [`crate::batch::BatchEngine`] methods; nothing is enqueued.
//!
//! * [`ConfigError`]: a configuration update, import or environment override
//!   was rejected. Rejection is atomic: the live document is never partially
//!   changed.
//!
//! * [`ExecutorError`]: the conversion collaborator failed a single call.
//!   The engine classifies it as transient (retried with backoff) or
//!   permanent (task fails at once).
//!
//! * [`TaskError`]: **Non-fatal**: the final error recorded on one task.
//!   Stored inside [`crate::batch::TaskOutcome`] so sibling tasks in the same
//!   job are never affected.
//!
//! A score below the quality threshold is deliberately *not* an error; it
//! drives the auto-retry loop and, if unresolved, yields a
//! `completed_low_quality` outcome.

use std::path::PathBuf;
use thiserror::Error;

use crate::batch::{JobId, JobState};

/// Errors returned by the job-control surface of [`crate::batch::BatchEngine`].
#[derive(Debug, Error)]
pub enum BatchError {
    /// Job creation arguments were rejected; the job was not created.
    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    /// No job with this identifier is known to the engine.
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// `start_batch_processing` was called on a job that already left `queued`.
    #[error("Job {job_id} cannot be started: it is already {state}")]
    AlreadyStarted { job_id: JobId, state: JobState },

    /// Results were requested before the job reached a terminal state.
    #[error("Job {job_id} is still {state}; poll get_job_status until it finishes")]
    ResultsNotReady { job_id: JobId, state: JobState },

    /// The engine was shut down and no longer accepts jobs.
    #[error("Batch engine has been shut down; no new jobs are accepted")]
    EngineShutDown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A single bound or consistency violation found while validating a
/// configuration document or job settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `performance.max_workers`.
    pub field: String,
    /// Human-readable description of the violated bound.
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Join violations into one line for error messages.
pub(crate) fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the adaptive configuration layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more declared bounds were violated; nothing was applied.
    #[error("Configuration rejected: {}", describe_violations(.0))]
    Validation(Vec<Violation>),

    /// The document does not match the expected schema (missing required
    /// field, wrong type, malformed JSON).
    #[error("Configuration document '{path}' does not match the schema: {detail}")]
    Schema { path: PathBuf, detail: String },

    /// Reading or writing a configuration file failed.
    #[error("Failed to access configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An environment override could not be parsed for its field.
    #[error("Environment override {var}={value:?} is invalid: {detail}")]
    Env {
        var: String,
        value: String,
        detail: String,
    },

    /// `save_config` was called on a manager that was never given a path.
    #[error("No configuration path set; use export_config(path) instead")]
    NoPath,

    /// A profile operation named a profile that is not registered.
    #[error("Model profile '{0}' is not registered")]
    UnknownProfile(String),
}

/// Classified failure of one collaborator call.
///
/// `Unavailable` and `Unsupported` are permanent: retrying cannot help.
/// `Timeout` and `Transport` are transient and retried with backoff.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutorError {
    /// The call did not finish within its timeout.
    #[error("Conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The model or backend for the profile is not available.
    #[error("Model backend unavailable: {0}")]
    Unavailable(String),

    /// The collaborator cannot convert this input.
    #[error("Unsupported input: {0}")]
    Unsupported(String),

    /// Network or protocol failure talking to the inference service.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ExecutorError {
    /// Permanent errors fail the task immediately without consuming retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Unsupported(_))
    }
}

/// The final error recorded on a failed task.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskError {
    /// The detected file type has no conversion path.
    #[error("{file_id}: unsupported file format")]
    UnsupportedFormat { file_id: String },

    /// Settings named a model profile missing from the job's registry snapshot.
    #[error("{file_id}: model profile '{profile}' not found")]
    ProfileNotFound { file_id: String, profile: String },

    /// The collaborator reported a permanent failure.
    #[error("{file_id}: {error}")]
    Permanent {
        file_id: String,
        error: ExecutorError,
    },

    /// Transient failures persisted after every allowed retry.
    #[error("{file_id}: failed after {retries} retries: {error}")]
    RetriesExhausted {
        file_id: String,
        retries: u32,
        error: ExecutorError,
    },

    /// The job was cancelled before any attempt of this task succeeded.
    #[error("{file_id}: interrupted by job cancellation")]
    Interrupted { file_id: String },
}
