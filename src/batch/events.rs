//! Progress events pushed by the engine.
//!
//! # Why a broadcast channel?
//! Polling `get_job_status` works for request/response front ends, but a
//! terminal progress bar or a WebSocket wants pushes. A broadcast channel
//! lets any number of observers subscribe without the engine knowing about
//! them; a slow observer only loses events (`Lagged`), it never slows the
//! workers down.

use super::job::{JobCounts, JobId, JobState, TaskState};
use serde::Serialize;
use std::pin::Pin;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Why a task is being attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// Timeout or transport error.
    Transient,
    /// Score below threshold; the next attempt uses a stronger profile.
    Escalation,
    /// Score below threshold; same profile with fallback adjustments.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        job_id: JobId,
        total: usize,
        workers: usize,
    },
    TaskStarted {
        job_id: JobId,
        file_id: String,
    },
    AttemptFinished {
        job_id: JobId,
        file_id: String,
        attempt: u32,
        profile: String,
        score: Option<f64>,
        error: Option<String>,
    },
    Retrying {
        job_id: JobId,
        file_id: String,
        next_attempt: u32,
        reason: RetryReason,
        profile: String,
        delay_ms: u64,
    },
    TaskFinished {
        job_id: JobId,
        file_id: String,
        state: TaskState,
        score: Option<f64>,
    },
    /// Admission paused because resource usage is above the limits.
    Throttled {
        job_id: JobId,
        memory_mb: u64,
        cpu_percent: f64,
    },
    JobFinished {
        job_id: JobId,
        state: JobState,
        counts: JobCounts,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::TaskStarted { job_id, .. }
            | JobEvent::AttemptFinished { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::TaskFinished { job_id, .. }
            | JobEvent::Throttled { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => *job_id,
        }
    }
}

/// A boxed stream of engine events. Lagged gaps are skipped.
pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

pub(crate) fn into_stream(rx: tokio::sync::broadcast::Receiver<JobEvent>) -> EventStream {
    Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok()))
}
