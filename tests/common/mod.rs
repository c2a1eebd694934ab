//! Shared fixtures for the integration tests: scripted executors, a
//! fixed-score assessor and engine construction.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_docbatch::batch::StaticProbe;
use edgequake_docbatch::config::PerformanceUpdate;
use edgequake_docbatch::types::{DocumentMetadata, QualitySubScores};
use edgequake_docbatch::{
    BatchEngine, ConfigDocument, ConfigManager, ConvertOutput, ConvertRequest, ExecutorError,
    FileRef, ModelProfile, PerformanceHistory, ProcessingInfo, QualityAssessor, QualityMetrics,
    TaskExecutor,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// An in-memory "image" that type detection recognises as PNG.
pub fn png(name: &str) -> FileRef {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    FileRef::buffer(name, bytes)
}

/// Text that the heuristic analyzer scores well.
pub const GOOD_MARKDOWN: &str = "# Quarterly Report\n\n\
The company reported steady growth in every region during the quarter. \
Revenue increased while operating costs remained stable across divisions.\n\n\
- Sales grew in the northern region\n\
- Support tickets were resolved faster\n\n\
Management expects similar results for the coming quarter based on current orders.\n";

// ── Executors ────────────────────────────────────────────────────────────

/// Replays a script of results, one per call, then repeats the last entry.
/// Records the profile of every call.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<String, ExecutorError>>>,
    last: Mutex<Result<String, ExecutorError>>,
    pub calls: AtomicUsize,
    pub profiles: Mutex<Vec<String>>,
    available: bool,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<String, ExecutorError>>) -> Self {
        let last = script
            .last()
            .cloned()
            .unwrap_or_else(|| Ok(GOOD_MARKDOWN.to_string()));
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            profiles: Mutex::new(Vec::new()),
            available: true,
        }
    }

    /// Always succeeds with `text`.
    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn unavailable() -> Self {
        let mut s = Self::always(GOOD_MARKDOWN);
        s.available = false;
        s
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn profiles(&self) -> Vec<String> {
        self.profiles.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profiles.lock().unwrap().push(request.settings.profile.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().unwrap().clone());
        next.map(|text| ConvertOutput {
            extracted_text: text,
            info: ProcessingInfo {
                profile: request.settings.profile,
                duration_ms: 1,
                page_count: 1,
                hybrid_used: request.settings.hybrid_ocr,
                ..Default::default()
            },
        })
    }

    async fn is_available(&self, _profile_name: &str, _profile: &ModelProfile) -> bool {
        self.available
    }
}

/// Blocks every call until the test releases a permit.
pub struct GatedExecutor {
    pub gate: Semaphore,
    pub calls: AtomicUsize,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        permit.forget();
        Ok(ConvertOutput {
            extracted_text: GOOD_MARKDOWN.to_string(),
            info: ProcessingInfo {
                profile: request.settings.profile,
                page_count: 1,
                ..Default::default()
            },
        })
    }
}

// ── Assessor ─────────────────────────────────────────────────────────────

/// Scores every attempt the same.
pub struct FixedAssessor(pub f64);

impl QualityAssessor for FixedAssessor {
    fn analyze_ocr_quality(
        &self,
        _metadata: &DocumentMetadata,
        _info: &ProcessingInfo,
        _extracted_text: &str,
    ) -> QualityMetrics {
        QualityMetrics {
            overall_score: self.0,
            confidence: 0.9,
            sub_scores: QualitySubScores {
                text_plausibility: self.0,
                structural_completeness: self.0,
                efficiency: self.0,
            },
            recommendations: Vec::new(),
        }
    }
}

// ── Engines ──────────────────────────────────────────────────────────────

/// Config manager with millisecond backoff so retry tests stay fast.
pub fn fast_config(doc: ConfigDocument) -> Arc<ConfigManager> {
    let config = ConfigManager::new(doc, Arc::new(PerformanceHistory::default()));
    config
        .update_performance_config(PerformanceUpdate {
            retry_base_delay_ms: Some(1),
            retry_max_delay_ms: Some(5),
            backpressure_poll_ms: Some(5),
            ..Default::default()
        })
        .expect("fast backoff settings are valid");
    Arc::new(config)
}

pub fn engine(config: Arc<ConfigManager>, assessor: Option<Arc<dyn QualityAssessor>>) -> BatchEngine {
    let mut b = BatchEngine::builder()
        .config(config)
        .resource_probe(Arc::new(StaticProbe::default()));
    if let Some(a) = assessor {
        b = b.assessor(a);
    }
    b.build()
}

/// Poll `cond` until it holds or a few seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
