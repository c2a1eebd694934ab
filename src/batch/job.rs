//! Job and task state, and the snapshots handed to callers.
//!
//! All mutable state of a job sits behind one `std::sync::Mutex`. Critical
//! sections are short (pop a task, flip a state, copy counters) and never
//! span an `.await`, so status reads never wait on in-flight conversions.
//! Counters are derived from task states under that lock, which keeps
//! `succeeded + failed + in_flight + queued == total` true in every snapshot.

use crate::config::ConfigDocument;
use crate::error::{describe_violations, BatchError, TaskError, Violation};
use crate::types::{FileCharacteristics, FileRef, FileType, ProcessingInfo, ProcessingSettings, QualityMetrics};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::watch;
use uuid::Uuid;

// ── Identifiers and states ───────────────────────────────────────────────

/// Opaque job identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::PartiallyCompleted => "partially_completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    CompletedLowQuality,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::CompletedLowQuality => "completed_low_quality",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Job settings ─────────────────────────────────────────────────────────

/// Job-level overrides on top of the configuration document. `None` keeps
/// whatever the configuration resolves per file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Worker pool size for this job. Default: `performance.max_workers`.
    pub max_workers: Option<usize>,
    /// Pin every file to this profile. Disables escalation; fallback
    /// retries on the same profile still apply.
    pub profile: Option<String>,
    pub quality_threshold: Option<f64>,
    pub max_retries: Option<u32>,
    pub max_retry_attempts: Option<u32>,
    pub enable_auto_retry: Option<bool>,
    pub hybrid_ocr: Option<bool>,
    pub max_image_size: Option<u32>,
    pub timeout_multiplier: Option<f64>,
}

impl JobSettings {
    pub fn builder() -> JobSettingsBuilder {
        JobSettingsBuilder {
            settings: Self::default(),
        }
    }

    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        if let Some(n) = self.max_workers {
            if !(1..=64).contains(&n) {
                out.push(Violation::new("max_workers", format!("must be 1–64, got {n}")));
            }
        }
        if let Some(t) = self.quality_threshold {
            if !(t.is_finite() && (0.0..=1.0).contains(&t)) {
                out.push(Violation::new("quality_threshold", format!("must be within [0, 1], got {t}")));
            }
        }
        if let Some(n) = self.max_retries {
            if n > 10 {
                out.push(Violation::new("max_retries", format!("must be 0–10, got {n}")));
            }
        }
        if let Some(n) = self.max_retry_attempts {
            if n > 10 {
                out.push(Violation::new("max_retry_attempts", format!("must be 0–10, got {n}")));
            }
        }
        if let Some(px) = self.max_image_size {
            if !(256..=8192).contains(&px) {
                out.push(Violation::new("max_image_size", format!("must be 256–8192, got {px}")));
            }
        }
        if let Some(m) = self.timeout_multiplier {
            if !(m.is_finite() && m > 0.0 && m <= 10.0) {
                out.push(Violation::new("timeout_multiplier", format!("must be within (0, 10], got {m}")));
            }
        }
        if let Some(p) = &self.profile {
            if p.trim().is_empty() {
                out.push(Violation::new("profile", "must not be empty"));
            }
        }
        out
    }

    /// Overlay the overrides on resolved per-file settings.
    pub(crate) fn apply(&self, s: &mut ProcessingSettings) {
        if let Some(v) = self.quality_threshold {
            s.quality_threshold = v;
        }
        if let Some(v) = self.max_retries {
            s.max_retries = v;
        }
        if let Some(v) = self.max_retry_attempts {
            s.max_retry_attempts = v;
        }
        if let Some(v) = self.enable_auto_retry {
            s.enable_auto_retry = v;
        }
        if let Some(v) = self.hybrid_ocr {
            s.hybrid_ocr = v;
        }
        if let Some(v) = self.max_image_size {
            s.max_image_size = v;
        }
        if let Some(v) = self.timeout_multiplier {
            s.timeout_multiplier = v;
        }
    }
}

/// Builder for [`JobSettings`].
#[derive(Debug)]
pub struct JobSettingsBuilder {
    settings: JobSettings,
}

impl JobSettingsBuilder {
    pub fn max_workers(mut self, n: usize) -> Self {
        self.settings.max_workers = Some(n);
        self
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.settings.profile = Some(name.into());
        self
    }

    pub fn quality_threshold(mut self, t: f64) -> Self {
        self.settings.quality_threshold = Some(t);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.settings.max_retries = Some(n);
        self
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.settings.max_retry_attempts = Some(n);
        self
    }

    pub fn enable_auto_retry(mut self, v: bool) -> Self {
        self.settings.enable_auto_retry = Some(v);
        self
    }

    pub fn hybrid_ocr(mut self, v: bool) -> Self {
        self.settings.hybrid_ocr = Some(v);
        self
    }

    pub fn max_image_size(mut self, px: u32) -> Self {
        self.settings.max_image_size = Some(px);
        self
    }

    pub fn timeout_multiplier(mut self, m: f64) -> Self {
        self.settings.timeout_multiplier = Some(m);
        self
    }

    /// Build, rejecting out-of-range values.
    pub fn build(self) -> Result<JobSettings, BatchError> {
        let violations = self.settings.validate();
        if violations.is_empty() {
            Ok(self.settings)
        } else {
            Err(BatchError::InvalidInput(describe_violations(&violations)))
        }
    }
}

// ── Outcomes and snapshots ───────────────────────────────────────────────

/// Final result for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Best attempt met the quality threshold.
    Completed {
        text: String,
        metrics: QualityMetrics,
        info: ProcessingInfo,
        attempts: u32,
    },
    /// Retries were exhausted (or not allowed) below the threshold; the best
    /// attempt is kept.
    CompletedLowQuality {
        text: String,
        metrics: QualityMetrics,
        info: ProcessingInfo,
        attempts: u32,
    },
    Failed {
        error: TaskError,
        attempts: u32,
    },
    /// Never started because the job was cancelled.
    Cancelled,
}

impl TaskOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { text, .. } | TaskOutcome::CompletedLowQuality { text, .. } => {
                Some(text)
            }
            _ => None,
        }
    }

    pub fn metrics(&self) -> Option<&QualityMetrics> {
        match self {
            TaskOutcome::Completed { metrics, .. }
            | TaskOutcome::CompletedLowQuality { metrics, .. } => Some(metrics),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<&ProcessingInfo> {
        match self {
            TaskOutcome::Completed { info, .. } | TaskOutcome::CompletedLowQuality { info, .. } => {
                Some(info)
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    fn state(&self) -> Option<TaskState> {
        match self {
            TaskOutcome::Completed { .. } => Some(TaskState::Completed),
            TaskOutcome::CompletedLowQuality { .. } => Some(TaskState::CompletedLowQuality),
            TaskOutcome::Failed { .. } => Some(TaskState::Failed),
            TaskOutcome::Cancelled => None,
        }
    }
}

/// Progress counters. `succeeded` counts both completed states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub file_id: String,
    pub state: TaskState,
    pub file_type: FileType,
    /// Profile of the latest attempt.
    pub profile: Option<String>,
    pub attempts: u32,
    pub transient_retries: u32,
    pub quality_retries: u32,
    pub last_score: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    /// Share of tasks in a terminal state, 0–100.
    pub progress_percent: f64,
    pub counts: JobCounts,
    pub tasks: Vec<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub state: JobState,
    pub results: BTreeMap<String, TaskOutcome>,
}

/// One line of [`crate::batch::BatchEngine::list_jobs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub created_at: SystemTime,
    pub counts: JobCounts,
}

// ── Internal job state ───────────────────────────────────────────────────

/// What a worker needs to run one task, copied out of the lock.
#[derive(Debug, Clone)]
pub(crate) struct TaskInput {
    pub index: usize,
    pub file: FileRef,
    pub file_type: FileType,
    pub characteristics: FileCharacteristics,
}

#[derive(Debug)]
pub(crate) struct FileTask {
    input: TaskInput,
    state: TaskState,
    profile: Option<String>,
    attempts: u32,
    transient_retries: u32,
    quality_retries: u32,
    last_score: Option<f64>,
    last_error: Option<String>,
    outcome: Option<TaskOutcome>,
}

impl FileTask {
    pub(crate) fn new(input: TaskInput) -> Self {
        Self {
            input,
            state: TaskState::Queued,
            profile: None,
            attempts: 0,
            transient_retries: 0,
            quality_retries: 0,
            last_score: None,
            last_error: None,
            outcome: None,
        }
    }

    fn status(&self) -> TaskStatus {
        TaskStatus {
            file_id: self.input.file.id.clone(),
            state: self.state,
            file_type: self.input.file_type,
            profile: self.profile.clone(),
            attempts: self.attempts,
            transient_retries: self.transient_retries,
            quality_retries: self.quality_retries,
            last_score: self.last_score,
            last_error: self.last_error.clone(),
        }
    }
}

/// Attempt bookkeeping reported by the worker.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttemptNote<'a> {
    Started { profile: &'a str },
    Scored(f64),
    Errored(&'a str),
    TransientRetry,
    QualityRetry,
}

#[derive(Debug)]
struct JobInner {
    state: JobState,
    tasks: Vec<FileTask>,
    queue: VecDeque<usize>,
}

impl JobInner {
    fn counts(&self) -> JobCounts {
        let mut c = JobCounts {
            total: self.tasks.len(),
            ..Default::default()
        };
        for t in &self.tasks {
            match t.state {
                TaskState::Queued => c.queued += 1,
                TaskState::Running => c.in_flight += 1,
                TaskState::Completed | TaskState::CompletedLowQuality => c.succeeded += 1,
                TaskState::Failed => c.failed += 1,
            }
        }
        c
    }
}

/// A batch job. Shared between the engine, its workers, and callers'
/// status reads via `Arc`.
#[derive(Debug)]
pub(crate) struct Job {
    pub id: JobId,
    pub created_at: SystemTime,
    pub settings: JobSettings,
    /// Configuration as of job creation.
    pub config: Arc<ConfigDocument>,
    inner: Mutex<JobInner>,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<JobState>,
}

impl Job {
    pub(crate) fn new(
        settings: JobSettings,
        config: Arc<ConfigDocument>,
        tasks: Vec<FileTask>,
    ) -> Self {
        let queue = (0..tasks.len()).collect();
        Self {
            id: JobId::new(),
            created_at: SystemTime::now(),
            settings,
            config,
            inner: Mutex::new(JobInner {
                state: JobState::Queued,
                tasks,
                queue,
            }),
            cancel_tx: watch::channel(false).0,
            state_tx: watch::channel(JobState::Queued).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut JobInner, state: JobState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock().state
    }

    pub(crate) fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn state_signal(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// `queued → running`. Anything else is `AlreadyStarted`.
    pub(crate) fn start(&self) -> Result<(), BatchError> {
        let mut inner = self.lock();
        if inner.state != JobState::Queued {
            return Err(BatchError::AlreadyStarted {
                job_id: self.id,
                state: inner.state,
            });
        }
        self.set_state(&mut inner, JobState::Running);
        Ok(())
    }

    /// Raise the cancellation flag. A job that never started ends here.
    /// Returns the state after the call.
    pub(crate) fn cancel(&self) -> JobState {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return inner.state;
        }
        // Set under the lock so no worker can pop a task after seeing `false`.
        self.cancel_tx.send_replace(true);
        if inner.state == JobState::Queued {
            self.set_state(&mut inner, JobState::Cancelled);
        }
        inner.state
    }

    /// Pop the next queued task and mark it running, unless cancelled.
    pub(crate) fn next_task(&self) -> Option<TaskInput> {
        let mut inner = self.lock();
        if self.is_cancelled() || inner.state != JobState::Running {
            return None;
        }
        let idx = inner.queue.pop_front()?;
        let task = &mut inner.tasks[idx];
        task.state = TaskState::Running;
        Some(task.input.clone())
    }

    pub(crate) fn note(&self, idx: usize, note: AttemptNote<'_>) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(idx) else {
            return;
        };
        match note {
            AttemptNote::Started { profile } => {
                task.attempts += 1;
                task.profile = Some(profile.to_string());
            }
            AttemptNote::Scored(score) => {
                task.last_score = Some(score);
                task.last_error = None;
            }
            AttemptNote::Errored(msg) => task.last_error = Some(msg.to_string()),
            AttemptNote::TransientRetry => task.transient_retries += 1,
            AttemptNote::QualityRetry => task.quality_retries += 1,
        }
    }

    /// Record a task's outcome and terminal state.
    pub(crate) fn finish_task(&self, idx: usize, outcome: TaskOutcome) -> TaskState {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(idx) else {
            return TaskState::Failed;
        };
        let state = outcome.state().unwrap_or(TaskState::Failed);
        if let TaskOutcome::Failed { error, .. } = &outcome {
            task.last_error = Some(error.to_string());
        }
        task.state = state;
        task.outcome = Some(outcome);
        state
    }

    /// Settle the job once every worker has exited.
    ///
    /// Tasks still marked running belong to a worker that died; they are
    /// failed as interrupted so the counters stay whole.
    pub(crate) fn finalize(&self) -> JobState {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return inner.state;
        }
        for task in inner.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
            let error = TaskError::Interrupted {
                file_id: task.input.file.id.clone(),
            };
            task.last_error = Some(error.to_string());
            task.state = TaskState::Failed;
            task.outcome = Some(TaskOutcome::Failed {
                error,
                attempts: task.attempts,
            });
        }

        let counts = inner.counts();
        let state = if self.is_cancelled() {
            JobState::Cancelled
        } else if counts.failed == counts.total {
            JobState::Failed
        } else if counts.failed > 0 {
            JobState::PartiallyCompleted
        } else {
            JobState::Completed
        };
        self.set_state(&mut inner, state);
        state
    }

    pub(crate) fn counts(&self) -> JobCounts {
        self.lock().counts()
    }

    pub(crate) fn status(&self) -> JobStatus {
        let inner = self.lock();
        let counts = inner.counts();
        let done = counts.succeeded + counts.failed;
        let progress_percent = if counts.total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / counts.total as f64
        };
        JobStatus {
            job_id: self.id,
            state: inner.state,
            progress_percent,
            counts,
            tasks: inner.tasks.iter().map(FileTask::status).collect(),
        }
    }

    pub(crate) fn summary(&self) -> JobSummary {
        let inner = self.lock();
        JobSummary {
            job_id: self.id,
            state: inner.state,
            created_at: self.created_at,
            counts: inner.counts(),
        }
    }

    pub(crate) fn results(&self) -> Result<JobResults, BatchError> {
        let inner = self.lock();
        if !inner.state.is_terminal() {
            return Err(BatchError::ResultsNotReady {
                job_id: self.id,
                state: inner.state,
            });
        }
        let results = inner
            .tasks
            .iter()
            .map(|t| {
                let outcome = t.outcome.clone().unwrap_or(TaskOutcome::Cancelled);
                (t.input.file.id.clone(), outcome)
            })
            .collect();
        Ok(JobResults {
            job_id: self.id,
            state: inner.state,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(n: usize) -> Job {
        let tasks = (0..n)
            .map(|i| {
                let file = FileRef::buffer(format!("f{i}.png"), vec![0u8; 4]);
                FileTask::new(TaskInput {
                    index: i,
                    file,
                    file_type: FileType::Image,
                    characteristics: FileCharacteristics::new(FileType::Image, 4),
                })
            })
            .collect();
        Job::new(JobSettings::default(), Arc::new(ConfigDocument::default()), tasks)
    }

    fn assert_counts_whole(j: &Job) {
        let c = j.counts();
        assert_eq!(c.succeeded + c.failed + c.in_flight + c.queued, c.total);
    }

    #[test]
    fn job_id_round_trips_through_string() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn lifecycle_keeps_counters_whole() {
        let j = job(3);
        assert!(j.next_task().is_none(), "queued jobs hand out nothing");
        j.start().unwrap();
        assert!(matches!(j.start(), Err(BatchError::AlreadyStarted { .. })));

        let t = j.next_task().unwrap();
        assert_eq!(t.index, 0);
        assert_counts_whole(&j);
        assert_eq!(j.counts().in_flight, 1);

        j.finish_task(
            t.index,
            TaskOutcome::Failed {
                error: TaskError::UnsupportedFormat { file_id: "f0.png".into() },
                attempts: 0,
            },
        );
        assert_counts_whole(&j);
        assert!(matches!(j.results(), Err(BatchError::ResultsNotReady { .. })));
    }

    #[test]
    fn cancel_stops_dequeue_and_settles_cancelled() {
        let j = job(3);
        j.start().unwrap();
        let t = j.next_task().unwrap();
        assert_eq!(j.cancel(), JobState::Running);
        assert!(j.next_task().is_none());

        // The in-flight task is abandoned by a dead worker.
        let _ = t;
        assert_eq!(j.finalize(), JobState::Cancelled);
        let c = j.counts();
        assert_eq!((c.failed, c.queued), (1, 2));
        let results = j.results().unwrap();
        assert_eq!(results.results["f1.png"], TaskOutcome::Cancelled);
    }

    #[test]
    fn cancelling_a_queued_job_is_immediate_and_idempotent() {
        let j = job(1);
        assert_eq!(j.cancel(), JobState::Cancelled);
        assert_eq!(j.cancel(), JobState::Cancelled);
        assert!(matches!(j.start(), Err(BatchError::AlreadyStarted { .. })));
    }

    #[test]
    fn settings_builder_validates() {
        assert!(JobSettings::builder().max_workers(0).build().is_err());
        assert!(JobSettings::builder().quality_threshold(1.2).build().is_err());
        let s = JobSettings::builder().max_workers(2).profile("minicpm-v").build().unwrap();
        assert_eq!(s.max_workers, Some(2));
    }

    #[test]
    fn all_failed_means_failed_job() {
        let j = job(2);
        j.start().unwrap();
        while let Some(t) = j.next_task() {
            j.finish_task(
                t.index,
                TaskOutcome::Failed {
                    error: TaskError::Interrupted { file_id: t.file.id.clone() },
                    attempts: 1,
                },
            );
        }
        assert_eq!(j.finalize(), JobState::Failed);
    }
}
