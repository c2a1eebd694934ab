use super::env::apply_env_overrides;
use super::selection::{self, Escalation};
use super::{ConfigDocument, OutputFormat, Strategy};
use crate::error::ConfigError;
use crate::history::{write_atomic, PerformanceHistory};
use crate::quality::ScoreWeights;
use crate::registry::ModelProfile;
use crate::types::{FileCharacteristics, FileType, ProcessingSettings};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Partial update of the `performance` section. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct PerformanceUpdate {
    pub max_workers: Option<usize>,
    pub max_concurrent_tasks: Option<usize>,
    pub max_retries: Option<u32>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit_percent: Option<f64>,
    pub enable_caching: Option<bool>,
    pub cache_ttl_hours: Option<u64>,
    pub enable_compression: Option<bool>,
    pub compression_quality: Option<u8>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub max_image_size: Option<u32>,
    pub large_file_threshold_mb: Option<u64>,
    pub backpressure_poll_ms: Option<u64>,
}

/// Partial update of the `quality` section.
#[derive(Debug, Clone, Default)]
pub struct QualityUpdate {
    pub min_confidence_threshold: Option<f64>,
    pub enable_quality_prediction: Option<bool>,
    pub enable_auto_retry: Option<bool>,
    pub max_retry_attempts: Option<u32>,
    pub quality_improvement_threshold: Option<f64>,
    pub enable_fallback_strategies: Option<bool>,
    pub enable_hybrid_ocr: Option<bool>,
    pub score_weights: Option<ScoreWeights>,
}

/// Partial update of the `user_preferences` section.
///
/// `preferred_model: Some(None)` clears the preference.
#[derive(Debug, Clone, Default)]
pub struct PreferencesUpdate {
    pub preferred_model: Option<Option<String>>,
    pub preferred_strategy: Option<Strategy>,
    pub auto_optimize_settings: Option<bool>,
    pub max_history_items: Option<usize>,
    pub output_format: Option<OutputFormat>,
}

macro_rules! merge {
    ($target:expr, $update:expr, [$($field:ident),* $(,)?]) => {
        $(if let Some(v) = $update.$field { $target.$field = v; })*
    };
}

/// Owner of the live configuration document.
///
/// Readers get an `Arc` snapshot and never see a half-applied update: every
/// mutation clones the document, applies and validates the change, then swaps
/// the pointer. Jobs keep the snapshot they were created with.
#[derive(Debug)]
pub struct ConfigManager {
    doc: RwLock<Arc<ConfigDocument>>,
    history: Arc<PerformanceHistory>,
    path: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(ConfigDocument::default(), Arc::new(PerformanceHistory::default()))
    }
}

impl ConfigManager {
    /// Wrap an already-validated document. Use [`ConfigManager::load`] for
    /// untrusted input.
    pub fn new(doc: ConfigDocument, history: Arc<PerformanceHistory>) -> Self {
        history.set_max_items(doc.user_preferences.max_history_items);
        Self {
            doc: RwLock::new(Arc::new(doc)),
            history,
            path: None,
        }
    }

    /// Build from built-in defaults, then the file at `path` if it exists,
    /// then `DOCBATCH_*` variables from `env`, then validate.
    ///
    /// The path is remembered for [`save_config`](Self::save_config) even
    /// when the file does not exist yet.
    pub fn load<I, K, V>(
        path: Option<&Path>,
        env: I,
        history: Arc<PerformanceHistory>,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let file_doc = match path {
            Some(p) if p.exists() => Some(read_document(p)?),
            _ => None,
        };
        let base = file_doc.unwrap_or_default();
        let doc = apply_env_overrides(base, env)?;
        let violations = doc.validate();
        if !violations.is_empty() {
            return Err(ConfigError::Validation(violations));
        }
        info!(
            path = ?path.map(|p| p.display().to_string()),
            models = doc.models.len(),
            "Configuration loaded"
        );
        let mut manager = Self::new(doc, history);
        manager.path = path.map(Path::to_path_buf);
        Ok(manager)
    }

    /// [`load`](Self::load) with the process environment.
    pub fn from_env(path: Option<&Path>, history: Arc<PerformanceHistory>) -> Result<Self, ConfigError> {
        Self::load(path, std::env::vars(), history)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Current document. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ConfigDocument> {
        let guard = self.doc.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn history(&self) -> &Arc<PerformanceHistory> {
        &self.history
    }

    // ── Settings ─────────────────────────────────────────────────────────

    /// Settings for a file known only by type and size.
    pub fn get_optimal_settings(&self, file_type: FileType, size_bytes: u64) -> ProcessingSettings {
        self.optimal_settings_for(&FileCharacteristics::new(file_type, size_bytes))
    }

    /// Settings for a file with detected traits.
    pub fn optimal_settings_for(&self, characteristics: &FileCharacteristics) -> ProcessingSettings {
        settings_in(&self.snapshot(), characteristics, &self.history)
    }

    /// Profile names best suited to `characteristics`, best first.
    pub fn get_model_recommendations(&self, characteristics: &FileCharacteristics) -> Vec<String> {
        selection::recommend(&self.snapshot(), characteristics, &self.history)
    }

    /// Stronger profile to retry with after a low-quality attempt.
    pub fn escalate(&self, current_profile: &str, characteristics: &FileCharacteristics) -> Escalation {
        escalate_in(&self.snapshot(), current_profile, characteristics, &self.history)
    }

    // ── Updates ──────────────────────────────────────────────────────────

    /// Clone, modify, validate, swap. Nothing changes on error.
    fn modify(&self, f: impl FnOnce(&mut ConfigDocument) -> Result<(), ConfigError>) -> Result<(), ConfigError> {
        let mut guard = self.doc.write().unwrap_or_else(|e| e.into_inner());
        let mut next = ConfigDocument::clone(&guard);
        f(&mut next)?;
        let violations = next.validate();
        if !violations.is_empty() {
            return Err(ConfigError::Validation(violations));
        }
        self.history.set_max_items(next.user_preferences.max_history_items);
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn update_performance_config(&self, update: PerformanceUpdate) -> Result<(), ConfigError> {
        self.modify(|doc| {
            merge!(doc.performance, update, [
                max_workers, max_concurrent_tasks, max_retries, memory_limit_mb,
                cpu_limit_percent, enable_caching, cache_ttl_hours, enable_compression,
                compression_quality, retry_base_delay_ms, retry_max_delay_ms,
                max_image_size, large_file_threshold_mb, backpressure_poll_ms,
            ]);
            Ok(())
        })?;
        debug!("Performance configuration updated");
        Ok(())
    }

    pub fn update_quality_config(&self, update: QualityUpdate) -> Result<(), ConfigError> {
        self.modify(|doc| {
            merge!(doc.quality, update, [
                min_confidence_threshold, enable_quality_prediction, enable_auto_retry,
                max_retry_attempts, quality_improvement_threshold,
                enable_fallback_strategies, enable_hybrid_ocr, score_weights,
            ]);
            Ok(())
        })?;
        debug!("Quality configuration updated");
        Ok(())
    }

    pub fn update_user_preferences(&self, update: PreferencesUpdate) -> Result<(), ConfigError> {
        self.modify(|doc| {
            merge!(doc.user_preferences, update, [
                preferred_model, preferred_strategy, auto_optimize_settings,
                max_history_items, output_format,
            ]);
            Ok(())
        })?;
        debug!("User preferences updated");
        Ok(())
    }

    /// Add or replace a model profile.
    pub fn upsert_profile(&self, name: impl Into<String>, profile: ModelProfile) -> Result<(), ConfigError> {
        let name = name.into();
        self.modify(|doc| {
            doc.models.insert(name.clone(), profile);
            Ok(())
        })?;
        info!(profile = %name, "Model profile registered");
        Ok(())
    }

    /// Remove a model profile. Fails if it is unknown, or if removing it
    /// would leave the document invalid (last profile, preferred model).
    pub fn remove_profile(&self, name: &str) -> Result<ModelProfile, ConfigError> {
        let mut removed = None;
        self.modify(|doc| {
            removed = doc.models.remove(name);
            if removed.is_none() {
                return Err(ConfigError::UnknownProfile(name.to_string()));
            }
            Ok(())
        })?;
        info!(profile = %name, "Model profile removed");
        removed.ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn validate_config(&self) -> Vec<crate::error::Violation> {
        self.snapshot().validate()
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write the document to the path it was loaded from.
    pub fn save_config(&self) -> Result<(), ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoPath)?;
        self.export_config(path)
    }

    /// Write the document as pretty JSON. Atomic.
    pub fn export_config(&self, path: &Path) -> Result<(), ConfigError> {
        let doc = self.snapshot();
        let json = serde_json::to_vec_pretty(doc.as_ref()).map_err(|e| ConfigError::Schema {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        write_atomic(path, &json)?;
        info!(path = %path.display(), "Configuration exported");
        Ok(())
    }

    /// Replace the whole document with the one at `path`. The file must be
    /// complete and valid; otherwise nothing changes.
    pub fn import_config(&self, path: &Path) -> Result<(), ConfigError> {
        let imported = read_document(path)?;
        self.modify(|doc| {
            *doc = imported;
            Ok(())
        })?;
        info!(path = %path.display(), "Configuration imported");
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<ConfigDocument, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| ConfigError::Schema {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Settings against a specific snapshot; the batch engine resolves against
/// the snapshot its job was created with.
pub(crate) fn settings_in(
    doc: &ConfigDocument,
    characteristics: &FileCharacteristics,
    history: &PerformanceHistory,
) -> ProcessingSettings {
    selection::resolve(doc, characteristics, history)
}

pub(crate) fn escalate_in(
    doc: &ConfigDocument,
    current_profile: &str,
    characteristics: &FileCharacteristics,
    history: &PerformanceHistory,
) -> Escalation {
    selection::escalate(doc, current_profile, characteristics, history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn manager() -> ConfigManager {
        ConfigManager::default()
    }

    #[test]
    fn partial_update_merges_only_given_fields() {
        let m = manager();
        m.update_performance_config(PerformanceUpdate {
            max_workers: Some(6),
            ..Default::default()
        })
        .unwrap();
        let doc = m.snapshot();
        assert_eq!(doc.performance.max_workers, 6);
        assert_eq!(doc.performance.max_retries, 3);
    }

    #[test]
    fn invalid_update_changes_nothing() {
        let m = manager();
        let before = m.snapshot();
        let err = m
            .update_quality_config(QualityUpdate {
                enable_auto_retry: Some(false),
                min_confidence_threshold: Some(-0.1),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert_eq!(*m.snapshot(), *before);
    }

    #[test]
    fn snapshots_are_copy_on_write() {
        let m = manager();
        let old = m.snapshot();
        m.update_user_preferences(PreferencesUpdate {
            preferred_strategy: Some(Strategy::Speed),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(old.user_preferences.preferred_strategy, Strategy::Auto);
        assert_eq!(m.snapshot().user_preferences.preferred_strategy, Strategy::Speed);
    }

    #[test]
    fn removing_preferred_profile_is_rejected() {
        let m = manager();
        m.update_user_preferences(PreferencesUpdate {
            preferred_model: Some(Some("minicpm-v".into())),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(m.remove_profile("minicpm-v"), Err(ConfigError::Validation(_))));
        assert!(matches!(m.remove_profile("ghost"), Err(ConfigError::UnknownProfile(_))));
        assert!(m.snapshot().models.contains_key("minicpm-v"));
    }

    #[test]
    fn save_without_path_fails() {
        assert!(matches!(manager().save_config(), Err(ConfigError::NoPath)));
    }

    #[test]
    fn load_applies_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docbatch.json");
        let mut doc = ConfigDocument::default();
        doc.performance.max_workers = 2;
        doc.performance.max_retries = 5;
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let m = ConfigManager::load(
            Some(&path),
            [("DOCBATCH_PERFORMANCE_MAX_RETRIES", "1")],
            Arc::new(PerformanceHistory::default()),
        )
        .unwrap();
        let snap = m.snapshot();
        assert_eq!(snap.performance.max_workers, 2);
        assert_eq!(snap.performance.max_retries, 1);
        m.save_config().unwrap();
    }

    #[test]
    fn load_rejects_out_of_range_env() {
        let err = ConfigManager::load(
            None,
            [("DOCBATCH_PERFORMANCE_MAX_WORKERS", "0")],
            Arc::new(PerformanceHistory::default()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
