//! Worker loop and the per-task attempt state machine.
//!
//! A worker repeatedly takes an admission permit, pops the next queued task
//! and drives it to a terminal state:
//!
//! ```text
//!  resolve settings ─► attempt ─► ok ──► score ─► ≥ threshold ─► completed
//!                        ▲   │                      │ below
//!                        │   │ transient            ▼
//!                        │   └─► backoff ─┐    escalate / fallback ─► retry
//!                        └────────────────┘    (budget left)
//!                                               │ no budget / no option
//!                                               ▼
//!                                        completed_low_quality
//! ```
//!
//! Task failures stay on the task. A worker never returns an error, so one
//! bad file cannot take siblings down with it.

use super::admission::AdmissionGate;
use super::events::{JobEvent, RetryReason};
use super::job::{AttemptNote, Job, TaskInput, TaskOutcome};
use super::retry::{sleep_or_cancel, BackoffPolicy};
use crate::config::{escalate_in, fallback_settings, settings_for_profile, settings_in, Escalation};
use crate::error::{ExecutorError, TaskError};
use crate::executor::{ConvertOutput, ConvertRequest, TaskExecutor};
use crate::history::{AttemptOutcome, PerformanceHistory, PerformanceRecord};
use crate::quality::QualityAssessor;
use crate::registry::ModelProfile;
use crate::types::{DocumentAnalysis, DocumentMetadata, FileType, ProcessingSettings, QualityMetrics};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Shared by every worker of one job.
pub(crate) struct WorkerContext {
    pub job: Arc<Job>,
    pub executor: Arc<dyn TaskExecutor>,
    pub assessor: Arc<dyn QualityAssessor>,
    pub history: Arc<PerformanceHistory>,
    pub gate: Arc<AdmissionGate>,
    pub events: broadcast::Sender<JobEvent>,
}

impl WorkerContext {
    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

pub(crate) async fn run_worker(ctx: Arc<WorkerContext>, worker: usize) {
    let mut handled = 0usize;
    loop {
        if ctx.job.is_cancelled() {
            break;
        }
        let Some(permit) = ctx.gate.admit(&ctx.job, &ctx.events).await else {
            break;
        };
        let Some(task) = ctx.job.next_task() else {
            break;
        };
        run_task(&ctx, task).await;
        drop(permit);
        handled += 1;
    }
    debug!(job_id = %ctx.job.id, worker, handled, "Worker exiting");
}

#[instrument(skip_all, fields(job_id = %ctx.job.id, file_id = %task.file.id))]
async fn run_task(ctx: &WorkerContext, task: TaskInput) {
    ctx.emit(JobEvent::TaskStarted {
        job_id: ctx.job.id,
        file_id: task.file.id.clone(),
    });

    let outcome = process(ctx, &task).await;
    let score = outcome.metrics().map(|m| m.overall_score);
    if let Some(error) = outcome.error() {
        warn!(error = %error, "Task failed");
    }
    let state = ctx.job.finish_task(task.index, outcome);
    info!(%state, ?score, "Task finished");

    ctx.emit(JobEvent::TaskFinished {
        job_id: ctx.job.id,
        file_id: task.file.id,
        state,
        score,
    });
}

/// Best successful attempt so far.
struct Best {
    output: ConvertOutput,
    metrics: QualityMetrics,
}

impl Best {
    fn score(&self) -> f64 {
        self.metrics.overall_score
    }
}

/// Whether `candidate` should replace `best`.
fn replaces(candidate: f64, best: f64, threshold: f64, min_gain: f64) -> bool {
    (candidate >= threshold && best < threshold) || candidate >= best + min_gain
}

/// Turn the best attempt into an outcome, or fail with `otherwise`.
fn settle(
    best: Option<Best>,
    threshold: f64,
    attempts: u32,
    otherwise: impl FnOnce() -> TaskError,
) -> TaskOutcome {
    match best {
        Some(b) if b.score() >= threshold => TaskOutcome::Completed {
            text: b.output.extracted_text,
            metrics: b.metrics,
            info: b.output.info,
            attempts,
        },
        Some(b) => TaskOutcome::CompletedLowQuality {
            text: b.output.extracted_text,
            metrics: b.metrics,
            info: b.output.info,
            attempts,
        },
        None => TaskOutcome::Failed {
            error: otherwise(),
            attempts,
        },
    }
}

async fn process(ctx: &WorkerContext, task: &TaskInput) -> TaskOutcome {
    let job = &ctx.job;
    let doc = &job.config;
    let idx = task.index;
    let file_id = task.file.id.clone();

    if task.file_type == FileType::Unknown {
        return TaskOutcome::Failed {
            error: TaskError::UnsupportedFormat { file_id },
            attempts: 0,
        };
    }

    // A pinned profile bypasses selection and escalation.
    let pinned = job.settings.profile.is_some();
    let mut settings = match &job.settings.profile {
        Some(name) => settings_for_profile(doc, name, &task.characteristics),
        None => settings_in(doc, &task.characteristics, &ctx.history),
    };
    job.settings.apply(&mut settings);

    // Budgets and the threshold are fixed for the whole task.
    let threshold = settings.quality_threshold;
    let transient_budget = settings.max_retries;
    let quality_budget = if settings.enable_auto_retry {
        settings.max_retry_attempts
    } else {
        0
    };
    let min_gain = doc.quality.quality_improvement_threshold;
    let backoff = BackoffPolicy::from_millis(
        doc.performance.retry_base_delay_ms,
        doc.performance.retry_max_delay_ms,
    );
    debug!(
        profile = %settings.profile,
        threshold,
        transient_budget,
        quality_budget,
        "Resolved task settings"
    );

    let base_metadata = DocumentMetadata {
        file_type: Some(task.file_type),
        size_bytes: task.characteristics.size_bytes,
        page_count: 0,
        page_area_sq_in: None,
        analysis: DocumentAnalysis::from_traits(&task.characteristics.traits),
    };

    let mut cancel = job.cancel_signal();
    let mut best: Option<Best> = None;
    let mut attempts = 0u32;
    let mut transient_used = 0u32;
    let mut quality_used = 0u32;

    loop {
        let Some(profile) = doc.models.get(&settings.profile) else {
            let profile = settings.profile.clone();
            return settle(best, threshold, attempts, || TaskError::ProfileNotFound {
                file_id,
                profile,
            });
        };

        if job.is_cancelled() {
            return settle(best, threshold, attempts, || TaskError::Interrupted { file_id });
        }

        attempts += 1;
        job.note(idx, AttemptNote::Started { profile: &settings.profile });
        let started = Instant::now();
        let result = call(ctx, task, profile, &settings, attempts).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut output) => {
                if output.info.profile.is_empty() {
                    output.info.profile = settings.profile.clone();
                }
                if output.info.expected_duration_ms.is_none() {
                    output.info.expected_duration_ms = Some(
                        profile
                            .resource_class
                            .expected_duration_ms(task.characteristics.size_bytes),
                    );
                }
                let metadata = DocumentMetadata {
                    page_count: output.info.page_count,
                    page_area_sq_in: output.info.page_area_sq_in,
                    ..base_metadata.clone()
                };
                let metrics =
                    ctx.assessor
                        .analyze_ocr_quality(&metadata, &output.info, &output.extracted_text);
                let score = metrics.overall_score;

                ctx.history.record(PerformanceRecord::new(
                    settings.profile.as_str(),
                    task.file_type,
                    AttemptOutcome::Success,
                    Some(score),
                    output.info.duration_ms,
                ));
                job.note(idx, AttemptNote::Scored(score));
                ctx.emit(JobEvent::AttemptFinished {
                    job_id: job.id,
                    file_id: file_id.clone(),
                    attempt: attempts,
                    profile: settings.profile.clone(),
                    score: Some(score),
                    error: None,
                });
                debug!(attempt = attempts, score, confidence = metrics.confidence, "Attempt scored");

                let candidate = Best { output, metrics };
                best = match best.take() {
                    Some(prev) if !replaces(score, prev.score(), threshold, min_gain) => Some(prev),
                    _ => Some(candidate),
                };
                let best_score = best.as_ref().map(Best::score).unwrap_or(score);

                if best_score >= threshold || quality_used >= quality_budget || job.is_cancelled() {
                    return settle(best, threshold, attempts, || TaskError::Interrupted { file_id });
                }

                let next = if pinned {
                    Escalation::NoEscalation
                } else {
                    escalate_in(doc, &settings.profile, &task.characteristics, &ctx.history)
                };
                let (next_settings, reason) = match next {
                    Escalation::Profile(name) => {
                        let mut s = settings_for_profile(doc, &name, &task.characteristics);
                        job.settings.apply(&mut s);
                        (s, RetryReason::Escalation)
                    }
                    Escalation::NoEscalation if doc.quality.enable_fallback_strategies => {
                        match fallback_settings(&settings) {
                            Some(s) => (s, RetryReason::Fallback),
                            None => {
                                return settle(best, threshold, attempts, || {
                                    TaskError::Interrupted { file_id }
                                })
                            }
                        }
                    }
                    Escalation::NoEscalation => {
                        return settle(best, threshold, attempts, || TaskError::Interrupted { file_id })
                    }
                };

                quality_used += 1;
                job.note(idx, AttemptNote::QualityRetry);
                info!(
                    score,
                    threshold,
                    from = %settings.profile,
                    to = %next_settings.profile,
                    ?reason,
                    "Below quality threshold, retrying"
                );
                ctx.emit(JobEvent::Retrying {
                    job_id: job.id,
                    file_id: file_id.clone(),
                    next_attempt: attempts + 1,
                    reason,
                    profile: next_settings.profile.clone(),
                    delay_ms: 0,
                });
                settings = next_settings;
            }
            Err(error) => {
                let outcome = if error.is_permanent() {
                    AttemptOutcome::PermanentFailure
                } else {
                    AttemptOutcome::TransientFailure
                };
                ctx.history.record(PerformanceRecord::new(
                    settings.profile.as_str(),
                    task.file_type,
                    outcome,
                    None,
                    elapsed_ms,
                ));
                let message = error.to_string();
                job.note(idx, AttemptNote::Errored(&message));
                ctx.emit(JobEvent::AttemptFinished {
                    job_id: job.id,
                    file_id: file_id.clone(),
                    attempt: attempts,
                    profile: settings.profile.clone(),
                    score: None,
                    error: Some(message),
                });

                if error.is_permanent() {
                    warn!(attempt = attempts, error = %error, "Permanent collaborator error");
                    return settle(best, threshold, attempts, || TaskError::Permanent {
                        file_id,
                        error,
                    });
                }
                if transient_used >= transient_budget {
                    warn!(attempt = attempts, retries = transient_used, error = %error, "Retry budget exhausted");
                    return settle(best, threshold, attempts, || TaskError::RetriesExhausted {
                        file_id,
                        retries: transient_used,
                        error,
                    });
                }

                transient_used += 1;
                job.note(idx, AttemptNote::TransientRetry);
                let delay = backoff.delay(transient_used);
                warn!(
                    attempt = attempts,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient collaborator error, backing off"
                );
                ctx.emit(JobEvent::Retrying {
                    job_id: job.id,
                    file_id: file_id.clone(),
                    next_attempt: attempts + 1,
                    reason: RetryReason::Transient,
                    profile: settings.profile.clone(),
                    delay_ms: delay.as_millis() as u64,
                });
                if !sleep_or_cancel(delay, &mut cancel).await {
                    return settle(best, threshold, attempts, || TaskError::Interrupted { file_id });
                }
            }
        }
    }
}

/// One collaborator call under the engine-enforced deadline.
async fn call(
    ctx: &WorkerContext,
    task: &TaskInput,
    profile: &ModelProfile,
    settings: &ProcessingSettings,
    attempt: u32,
) -> Result<ConvertOutput, ExecutorError> {
    if !ctx.executor.is_available(&settings.profile, profile).await {
        return Err(ExecutorError::Unavailable(format!(
            "profile '{}' ({} / {}) is not available",
            settings.profile, profile.provider, profile.model
        )));
    }
    let timeout = settings.timeout();
    let request = ConvertRequest {
        file: task.file.clone(),
        file_type: task.file_type,
        profile: profile.clone(),
        settings: settings.clone(),
        timeout,
        attempt,
    };
    match tokio::time::timeout(timeout, ctx.executor.convert(request)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutorError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_needs_a_real_gain() {
        // Small gains below threshold do not replace.
        assert!(!replaces(0.52, 0.50, 0.7, 0.05));
        assert!(replaces(0.56, 0.50, 0.7, 0.05));
        // Crossing the threshold always replaces.
        assert!(replaces(0.71, 0.69, 0.7, 0.05));
        // Worse never replaces.
        assert!(!replaces(0.40, 0.50, 0.7, 0.0));
    }

    #[test]
    fn settle_without_success_uses_the_error() {
        let out = settle(None, 0.7, 2, || TaskError::Interrupted { file_id: "a".into() });
        assert!(matches!(out, TaskOutcome::Failed { attempts: 2, .. }));
    }
}
