//! Engine-level tests with scripted collaborators: end-to-end scenarios,
//! retry budgets, cancellation and the counter invariant.

mod common;

use common::*;
use edgequake_docbatch::batch::{ResourceUsage, StaticProbe};
use edgequake_docbatch::history::AttemptOutcome;
use edgequake_docbatch::registry::default_profiles;
use edgequake_docbatch::{
    BatchEngine, BatchError, ConfigDocument, ExecutorError, FileRef, JobEvent, JobSettings, JobState,
    TaskError, TaskOutcome, TaskState,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn three_good_files_complete_without_retries() {
    let config = fast_config(ConfigDocument::default());
    let engine = engine(config, Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));

    let files = vec![png("a.png"), png("b.png"), png("c.png")];
    let settings = JobSettings::builder().max_workers(2).build().unwrap();
    let id = engine.create_batch_job(files, settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();

    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Completed);
    let results = engine.get_job_results(id).unwrap();
    assert_eq!(results.results.len(), 3);
    assert!(results
        .results
        .values()
        .all(|o| matches!(o, TaskOutcome::Completed { attempts: 1, .. })));

    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.progress_percent, 100.0);
    for t in &status.tasks {
        assert_eq!((t.transient_retries, t.quality_retries), (0, 0));
    }
    assert_eq!(exec.calls(), 3);
}

#[tokio::test]
async fn low_scores_end_low_quality_after_fallback_retries() {
    let config = fast_config(ConfigDocument::default());
    // Default heuristic analyzer: a single character scores far below 0.7.
    let engine = engine(config, None);
    let exec = Arc::new(ScriptedExecutor::always("x"));

    let settings = JobSettings::builder()
        .profile("minicpm-v")
        .max_retry_attempts(2)
        .enable_auto_retry(true)
        .build()
        .unwrap();
    let id = engine.create_batch_job(vec![png("page.png")], settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    engine.wait_for_job(id).await.unwrap();

    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.tasks[0].state, TaskState::CompletedLowQuality);
    assert_eq!(status.tasks[0].quality_retries, 2);
    assert_eq!(status.tasks[0].attempts, 3);

    let results = engine.get_job_results(id).unwrap();
    let outcome = &results.results["page.png"];
    let metrics = outcome.metrics().expect("low-quality outcomes carry metrics");
    assert!(metrics.overall_score < 0.7);
    assert!(!metrics.recommendations.is_empty());
    // Pinned profile: every retry stays on it.
    assert!(exec.profiles().iter().all(|p| p == "minicpm-v"));
}

#[tokio::test]
async fn escalation_climbs_to_a_heavier_profile() {
    let defaults = default_profiles();
    let mut models = BTreeMap::new();
    models.insert("small".to_string(), defaults["minicpm-v"].clone());
    models.insert("big".to_string(), defaults["llava-13b"].clone());
    let mut doc = ConfigDocument {
        models,
        ..Default::default()
    };
    doc.user_preferences.preferred_model = Some("small".into());
    doc.quality.max_retry_attempts = 2;

    let engine = engine(fast_config(doc), Some(Arc::new(FixedAssessor(0.3))));
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));
    let id = engine
        .create_batch_job(vec![png("page.png")], JobSettings::default())
        .await
        .unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    engine.wait_for_job(id).await.unwrap();

    // small → big (escalation) → big (fallback, nothing heavier exists).
    assert_eq!(exec.profiles(), vec!["small", "big", "big"]);
}

#[tokio::test]
async fn timeouts_then_success_within_retry_budget() {
    let config = fast_config(ConfigDocument::default());
    let history = Arc::clone(config.history());
    let engine = engine(config, Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(ScriptedExecutor::new(vec![
        Err(ExecutorError::Timeout { secs: 1 }),
        Err(ExecutorError::Timeout { secs: 1 }),
        Ok(GOOD_MARKDOWN.to_string()),
    ]));

    let settings = JobSettings::builder().max_retries(3).build().unwrap();
    let id = engine.create_batch_job(vec![png("a.png")], settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Completed);

    let results = engine.get_job_results(id).unwrap();
    assert!(matches!(
        results.results["a.png"],
        TaskOutcome::Completed { attempts: 3, .. }
    ));

    let records = history.records();
    let failures = records
        .iter()
        .filter(|r| r.outcome == AttemptOutcome::TransientFailure)
        .count();
    let successes = records
        .iter()
        .filter(|r| r.outcome == AttemptOutcome::Success)
        .count();
    assert_eq!((failures, successes), (2, 1));
}

#[tokio::test]
async fn cancellation_leaves_unstarted_tasks_queued() {
    let config = fast_config(ConfigDocument::default());
    let engine = engine(config, Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(GatedExecutor::new());

    let files = (0..5).map(|i| png(&format!("f{i}.png"))).collect();
    let settings = JobSettings::builder().max_workers(1).build().unwrap();
    let id = engine.create_batch_job(files, settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();

    assert!(
        eventually(|| exec.calls.load(std::sync::atomic::Ordering::SeqCst) == 1).await,
        "first task never reached the executor"
    );
    assert_eq!(engine.cancel_job(id).unwrap(), JobState::Running);
    exec.release(10);

    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Cancelled);
    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.counts.succeeded + status.counts.failed, 1);
    assert_eq!(status.counts.queued, 4);
    assert_eq!(status.counts.in_flight, 0);

    let results = engine.get_job_results(id).unwrap();
    let never_started = results
        .results
        .values()
        .filter(|o| **o == TaskOutcome::Cancelled)
        .count();
    assert_eq!(never_started, 4);
    assert_eq!(exec.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_before_start_is_immediate() {
    let engine = engine(fast_config(ConfigDocument::default()), None);
    let id = engine
        .create_batch_job(vec![png("a.png")], JobSettings::default())
        .await
        .unwrap();
    assert_eq!(engine.cancel_job(id).unwrap(), JobState::Cancelled);
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));
    assert!(matches!(
        engine.start_batch_processing(id, exec),
        Err(BatchError::AlreadyStarted { .. })
    ));
    // Terminal: cancelling again is a no-op.
    assert_eq!(engine.cancel_job(id).unwrap(), JobState::Cancelled);
}

#[tokio::test]
async fn transient_failures_stop_at_the_retry_budget() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(ScriptedExecutor::new(vec![Err(ExecutorError::Transport(
        "connection reset".into(),
    ))]));
    let settings = JobSettings::builder().max_retries(2).build().unwrap();
    let id = engine.create_batch_job(vec![png("a.png")], settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Failed);

    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.tasks[0].transient_retries, 2);
    assert_eq!(status.tasks[0].attempts, 3);
    let results = engine.get_job_results(id).unwrap();
    assert!(matches!(
        results.results["a.png"].error(),
        Some(TaskError::RetriesExhausted { retries: 2, .. })
    ));
}

#[tokio::test]
async fn unavailable_profile_fails_without_retrying() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(ScriptedExecutor::unavailable());
    let id = engine
        .create_batch_job(vec![png("a.png")], JobSettings::default())
        .await
        .unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    engine.wait_for_job(id).await.unwrap();

    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.tasks[0].attempts, 1);
    assert_eq!(status.tasks[0].transient_retries, 0);
    assert_eq!(exec.calls(), 0);
    let results = engine.get_job_results(id).unwrap();
    assert!(matches!(
        results.results["a.png"].error(),
        Some(TaskError::Permanent {
            error: ExecutorError::Unavailable(_),
            ..
        })
    ));
}

#[tokio::test]
async fn unknown_formats_and_profiles_fail_only_their_task() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));
    let files = vec![
        png("good.png"),
        FileRef::buffer("blob.xyz", vec![0u8; 32]),
    ];
    let id = engine.create_batch_job(files, JobSettings::default()).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    assert_eq!(
        engine.wait_for_job(id).await.unwrap(),
        JobState::PartiallyCompleted
    );
    let results = engine.get_job_results(id).unwrap();
    assert!(matches!(
        results.results["blob.xyz"],
        TaskOutcome::Failed {
            error: TaskError::UnsupportedFormat { .. },
            attempts: 0
        }
    ));
    assert!(results.results["good.png"].text().is_some());

    let pinned = JobSettings::builder().profile("no-such-profile").build().unwrap();
    let id = engine.create_batch_job(vec![png("a.png")], pinned).await.unwrap();
    engine.start_batch_processing(id, exec).unwrap();
    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Failed);
    let results = engine.get_job_results(id).unwrap();
    assert!(matches!(
        results.results["a.png"].error(),
        Some(TaskError::ProfileNotFound { .. })
    ));
}

#[tokio::test]
async fn counters_stay_whole_while_running() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(GatedExecutor::new());
    let files = (0..6).map(|i| png(&format!("f{i}.png"))).collect();
    let settings = JobSettings::builder().max_workers(3).build().unwrap();
    let id = engine.create_batch_job(files, settings).await.unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();

    for _ in 0..6 {
        let c = engine.get_job_status(id).unwrap().counts;
        assert_eq!(c.succeeded + c.failed + c.in_flight + c.queued, c.total);
        assert!(c.in_flight <= 3);
        exec.release(1);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Completed);
    let c = engine.get_job_status(id).unwrap().counts;
    assert_eq!((c.succeeded, c.total), (6, 6));
}

#[tokio::test]
async fn results_are_not_ready_while_running() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let exec = Arc::new(GatedExecutor::new());
    let id = engine
        .create_batch_job(vec![png("a.png")], JobSettings::default())
        .await
        .unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();
    assert!(matches!(
        engine.get_job_results(id),
        Err(BatchError::ResultsNotReady { .. })
    ));
    assert!(matches!(
        engine.remove_job(id),
        Err(BatchError::InvalidInput(_))
    ));
    exec.release(1);
    engine.wait_for_job(id).await.unwrap();
    assert!(engine.get_job_results(id).is_ok());
}

#[tokio::test]
async fn event_stream_reports_the_job() {
    let engine = engine(fast_config(ConfigDocument::default()), Some(Arc::new(FixedAssessor(0.9))));
    let mut events = engine.event_stream();
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));
    let id = engine
        .create_batch_job(vec![png("a.png"), png("b.png")], JobSettings::default())
        .await
        .unwrap();
    engine.start_batch_processing(id, exec).unwrap();

    let mut seen = Vec::new();
    let collect = async {
        while let Some(e) = events.next().await {
            let done = matches!(e, JobEvent::JobFinished { .. });
            seen.push(e);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("job should finish");

    assert!(matches!(seen.first(), Some(JobEvent::JobStarted { total: 2, .. })));
    let finished = seen
        .iter()
        .filter(|e| matches!(e, JobEvent::TaskFinished { .. }))
        .count();
    assert_eq!(finished, 2);
    assert!(seen.iter().all(|e| e.job_id() == id));
    match seen.last() {
        Some(JobEvent::JobFinished { state, counts, .. }) => {
            assert_eq!(*state, JobState::Completed);
            assert_eq!(counts.succeeded, 2);
        }
        other => panic!("expected JobFinished last, got {other:?}"),
    }
}

#[tokio::test]
async fn resource_pressure_holds_tasks_until_cancelled() {
    let over_limit = ResourceUsage {
        memory_mb: u64::MAX,
        cpu_percent: 0.0,
    };
    let engine = BatchEngine::builder()
        .config(fast_config(ConfigDocument::default()))
        .assessor(Arc::new(FixedAssessor(0.9)))
        .resource_probe(Arc::new(StaticProbe(over_limit)))
        .build();
    let mut events = engine.subscribe();
    let exec = Arc::new(ScriptedExecutor::always(GOOD_MARKDOWN));

    let settings = JobSettings::builder().max_workers(1).build().unwrap();
    let id = engine
        .create_batch_job(vec![png("a.png"), png("b.png")], settings)
        .await
        .unwrap();
    engine.start_batch_processing(id, exec.clone()).unwrap();

    let throttled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(JobEvent::Throttled { memory_mb, .. }) => break memory_mb,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("admission should report throttling");
    assert_eq!(throttled, u64::MAX);

    // Several poll intervals pass without anything being admitted.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(exec.calls(), 0);
    let status = engine.get_job_status(id).unwrap();
    assert_eq!(status.state, JobState::Running);
    assert_eq!((status.counts.in_flight, status.counts.queued), (0, 2));

    engine.cancel_job(id).unwrap();
    assert_eq!(engine.wait_for_job(id).await.unwrap(), JobState::Cancelled);
    assert_eq!(exec.calls(), 0);

    let mut repeats = 0;
    while let Ok(e) = events.try_recv() {
        if matches!(e, JobEvent::Throttled { .. }) {
            repeats += 1;
        }
    }
    assert_eq!(repeats, 0, "throttling is reported once per episode");
}
