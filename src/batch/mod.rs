//! Batch engine: jobs of many files, a bounded worker pool per job, and
//! cooperative cancellation.
//!
//! ## Lifecycle
//!
//! ```text
//! create_batch_job ──► queued ──► start_batch_processing ──► running
//!                        │                                     │
//!                        │ cancel_job                          │ workers drain
//!                        ▼                                     ▼
//!                    cancelled          completed | partially_completed | failed | cancelled
//! ```
//!
//! Creation validates the input, probes every file (size, magic bytes,
//! trait keywords) and freezes a snapshot of the configuration; later
//! configuration changes only affect jobs created afterwards.
//!
//! Starting spawns a supervisor task that owns a [`tokio::task::JoinSet`] of
//! workers (`max_workers`, capped at the number of files). Workers share the
//! job's FIFO queue and an engine-wide admission gate, so several jobs
//! running at once still respect `performance.max_concurrent_tasks`.
//!
//! Callers either poll [`BatchEngine::get_job_status`] or follow pushed
//! [`JobEvent`]s via [`BatchEngine::event_stream`].

mod admission;
mod events;
mod job;
mod retry;
mod worker;

pub use admission::{ResourceProbe, ResourceUsage, StaticProbe, SystemProbe};
pub use events::{EventStream, JobEvent, RetryReason};
pub use job::{
    JobCounts, JobId, JobResults, JobSettings, JobSettingsBuilder, JobState, JobStatus,
    JobSummary, TaskOutcome, TaskState, TaskStatus,
};
pub use retry::BackoffPolicy;

use crate::config::ConfigManager;
use crate::error::{describe_violations, BatchError};
use crate::executor::TaskExecutor;
use crate::quality::{QualityAnalyzer, QualityAssessor};
use crate::types::{FileCharacteristics, FileRef, FileType};
use admission::AdmissionGate;
use job::{FileTask, Job, TaskInput};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use worker::{run_worker, WorkerContext};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Builder for [`BatchEngine`].
pub struct BatchEngineBuilder {
    config: Option<Arc<ConfigManager>>,
    assessor: Option<Arc<dyn QualityAssessor>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    event_capacity: usize,
}

impl BatchEngineBuilder {
    pub fn config(mut self, config: Arc<ConfigManager>) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the heuristic [`QualityAnalyzer`] for every job.
    pub fn assessor(mut self, assessor: Arc<dyn QualityAssessor>) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Replace the `sysinfo` probe used for backpressure.
    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> BatchEngine {
        let config = self.config.unwrap_or_default();
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new()) as Arc<dyn ResourceProbe>);
        let max_concurrent = config.snapshot().performance.max_concurrent_tasks;
        let (events, _) = broadcast::channel(self.event_capacity);
        BatchEngine {
            config,
            assessor: self.assessor,
            gate: Arc::new(AdmissionGate::new(max_concurrent, probe)),
            jobs: RwLock::new(HashMap::new()),
            events,
            shut_down: AtomicBool::new(false),
        }
    }
}

/// Owner of all batch jobs in the process.
///
/// Cheap to share: wrap it in an `Arc` and hand clones to request handlers.
/// Every method takes `&self`.
pub struct BatchEngine {
    config: Arc<ConfigManager>,
    assessor: Option<Arc<dyn QualityAssessor>>,
    gate: Arc<AdmissionGate>,
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    events: broadcast::Sender<JobEvent>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("jobs", &self.read_jobs().len())
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl BatchEngine {
    pub fn builder() -> BatchEngineBuilder {
        BatchEngineBuilder {
            config: None,
            assessor: None,
            probe: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Engine over `config` with the default analyzer and system probe.
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn job(&self, job_id: JobId) -> Result<Arc<Job>, BatchError> {
        self.read_jobs()
            .get(&job_id)
            .cloned()
            .ok_or(BatchError::NotFound(job_id))
    }

    /// Register a job over `files`. Nothing runs until
    /// [`start_batch_processing`](Self::start_batch_processing).
    ///
    /// Rejected with `InvalidInput` when the list is empty, a file id
    /// repeats, a path cannot be read, or a setting is out of range.
    pub async fn create_batch_job(
        &self,
        files: Vec<FileRef>,
        settings: JobSettings,
    ) -> Result<JobId, BatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BatchError::EngineShutDown);
        }
        if files.is_empty() {
            return Err(BatchError::InvalidInput("at least one file is required".into()));
        }
        let violations = settings.validate();
        if !violations.is_empty() {
            return Err(BatchError::InvalidInput(describe_violations(&violations)));
        }
        let mut seen = HashSet::new();
        for f in &files {
            if !seen.insert(f.id.as_str()) {
                return Err(BatchError::InvalidInput(format!(
                    "duplicate file id '{}'",
                    f.id
                )));
            }
        }

        let config = self.config.snapshot();
        let large_mb = config.performance.large_file_threshold_mb;
        let mut tasks = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            let (size_bytes, head) = file.probe().await.map_err(|e| {
                BatchError::InvalidInput(format!("cannot read '{}': {e}", file.id))
            })?;
            let file_type = FileType::detect(file.name(), &head);
            let characteristics =
                FileCharacteristics::detect(file.name(), file_type, size_bytes, &file.hints, large_mb);
            debug!(
                file_id = %file.id,
                %file_type,
                size_bytes,
                traits = ?characteristics.traits,
                "File probed"
            );
            tasks.push(FileTask::new(TaskInput {
                index,
                file,
                file_type,
                characteristics,
            }));
        }

        let total = tasks.len();
        let job = Arc::new(Job::new(settings, config, tasks));
        let job_id = job.id;
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if self.shut_down.load(Ordering::Acquire) {
                return Err(BatchError::EngineShutDown);
            }
            jobs.insert(job_id, job);
        }
        info!(%job_id, files = total, "Batch job created");
        Ok(job_id)
    }

    /// Move a queued job to `running` and spawn its workers. Returns once
    /// the workers are spawned; use [`wait_for_job`](Self::wait_for_job) or
    /// the event stream to follow progress.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_batch_processing(
        &self,
        job_id: JobId,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), BatchError> {
        let job = self.job(job_id)?;
        job.start()?;

        let doc = Arc::clone(&job.config);
        let total = job.task_count();
        let workers = job
            .settings
            .max_workers
            .unwrap_or(doc.performance.max_workers)
            .clamp(1, total.max(1));
        let assessor = self.assessor.clone().unwrap_or_else(|| {
            Arc::new(QualityAnalyzer::new(doc.quality.score_weights)) as Arc<dyn QualityAssessor>
        });

        let ctx = Arc::new(WorkerContext {
            job,
            executor,
            assessor,
            history: Arc::clone(self.config.history()),
            gate: Arc::clone(&self.gate),
            events: self.events.clone(),
        });

        info!(%job_id, total, workers, "Batch job started");
        let _ = self.events.send(JobEvent::JobStarted {
            job_id,
            total,
            workers,
        });
        tokio::spawn(supervise(ctx, workers));
        Ok(())
    }

    /// Snapshot of a job. Never waits on in-flight conversions.
    pub fn get_job_status(&self, job_id: JobId) -> Result<JobStatus, BatchError> {
        Ok(self.job(job_id)?.status())
    }

    /// Per-file outcomes of a finished job.
    pub fn get_job_results(&self, job_id: JobId) -> Result<JobResults, BatchError> {
        self.job(job_id)?.results()
    }

    /// Request cancellation and return the state right after the request.
    ///
    /// A queued job is cancelled at once. A running job stops dequeuing;
    /// in-flight attempts finish (or are cut short during backoff) and the
    /// job then settles as `cancelled`. Cancelling a finished job does nothing.
    pub fn cancel_job(&self, job_id: JobId) -> Result<JobState, BatchError> {
        let job = self.job(job_id)?;
        let state = job.cancel();
        info!(%job_id, %state, "Cancellation requested");
        Ok(state)
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait_for_job(&self, job_id: JobId) -> Result<JobState, BatchError> {
        let job = self.job(job_id)?;
        let mut rx = job.state_signal();
        let state = rx
            .wait_for(JobState::is_terminal)
            .await
            .map(|s| *s)
            .map_err(|_| BatchError::Internal(format!("state channel of job {job_id} closed")))?;
        Ok(state)
    }

    /// Raw event receiver for every job on this engine.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Events for every job on this engine as a `Stream`. Events missed by a
    /// lagging consumer are skipped.
    pub fn event_stream(&self) -> EventStream {
        events::into_stream(self.events.subscribe())
    }

    /// All known jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        let mut out: Vec<JobSummary> = self.read_jobs().values().map(|j| j.summary()).collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Forget a finished job and its results.
    pub fn remove_job(&self, job_id: JobId) -> Result<JobSummary, BatchError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get(&job_id).ok_or(BatchError::NotFound(job_id))?;
        let state = job.state();
        if !state.is_terminal() {
            return Err(BatchError::InvalidInput(format!(
                "job {job_id} is still {state}; cancel it or wait before removing"
            )));
        }
        let summary = job.summary();
        jobs.remove(&job_id);
        debug!(%job_id, "Job removed");
        Ok(summary)
    }

    /// Cancel every job and refuse new ones. Existing jobs stay queryable.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs: Vec<Arc<Job>> = self.read_jobs().values().cloned().collect();
        for job in &jobs {
            job.cancel();
        }
        warn!(jobs = jobs.len(), "Batch engine shut down");
    }
}

/// Run a job's workers to completion, then settle its final state.
async fn supervise(ctx: Arc<WorkerContext>, workers: usize) {
    let job_id = ctx.job.id;
    let mut set = JoinSet::new();
    for w in 0..workers {
        set.spawn(run_worker(Arc::clone(&ctx), w));
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            // Its running task is failed as interrupted by finalize().
            error!(%job_id, error = %e, "Worker terminated abnormally");
        }
    }

    let state = ctx.job.finalize();
    let counts = ctx.job.counts();
    info!(
        %job_id,
        %state,
        succeeded = counts.succeeded,
        failed = counts.failed,
        queued = counts.queued,
        "Batch job finished"
    );
    let _ = ctx.events.send(JobEvent::JobFinished {
        job_id,
        state,
        counts,
    });
}
