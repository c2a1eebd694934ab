//! Adaptive configuration: the persisted document, its validation, and the
//! manager that turns it into per-task [`ProcessingSettings`].
//!
//! The document has four sections (`models`, `performance`, `quality`,
//! `user_preferences`) and is plain serde data so it can be exported,
//! imported and overridden from the environment as one unit.
//!
//! ## Why reject instead of clamp
//! Builders elsewhere in this crate clamp convenience inputs, but a persisted
//! document is shared state: a silently clamped `max_workers` would make two
//! operators reading the same file disagree about what runs. Out-of-range
//! values are therefore reported as [`Violation`]s and nothing is applied.
//!
//! [`ProcessingSettings`]: crate::types::ProcessingSettings

mod env;
mod manager;
mod selection;

pub use env::{apply_env_overrides, ENV_PREFIX};
pub use manager::{ConfigManager, PerformanceUpdate, PreferencesUpdate, QualityUpdate};
pub use selection::{fallback_settings, Escalation};
pub(crate) use manager::{escalate_in, settings_in};
pub(crate) use selection::settings_for_profile;

use crate::error::Violation;
use crate::quality::ScoreWeights;
use crate::registry::{default_profiles, ModelProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Upper bound for size settings given in MB (1 TiB).
const MAX_SIZE_MB: u64 = 1 << 20;

/// The whole persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    pub models: BTreeMap<String, ModelProfile>,
    pub performance: PerformanceConfig,
    pub quality: QualityConfig,
    pub user_preferences: UserPreferences,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            models: default_profiles(),
            performance: PerformanceConfig::default(),
            quality: QualityConfig::default(),
            user_preferences: UserPreferences::default(),
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Throughput and resource policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Default worker pool size per job. Range: 1–64. Default: 4.
    pub max_workers: usize,
    /// Process-wide cap on tasks admitted at once across all jobs.
    /// Range: 1–256, and at least `max_workers`. Default: 8.
    pub max_concurrent_tasks: usize,
    /// Transient-failure retry budget per task. Range: 0–10. Default: 3.
    pub max_retries: u32,
    /// Process memory above which admission pauses, in MB. Minimum 128.
    pub memory_limit_mb: u64,
    /// CPU usage above which admission pauses. Range: (0, 100].
    pub cpu_limit_percent: f64,
    pub enable_caching: bool,
    /// Result cache lifetime. Range: 1–720 hours. Default: 24.
    pub cache_ttl_hours: u64,
    pub enable_compression: bool,
    /// JPEG quality when compression is enabled. Range: 1–100. Default: 85.
    pub compression_quality: u8,

    /// First backoff delay; doubles per retry. Default: 500.
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling. Default: 30 000.
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Longest image edge sent to a model. Range: 256–8192. Default: 2048.
    #[serde(default = "defaults::max_image_size")]
    pub max_image_size: u32,
    /// Files above this size are treated as large documents.
    /// Range: 1–1 048 576 MB. Default: 20 MB.
    #[serde(default = "defaults::large_file_threshold_mb")]
    pub large_file_threshold_mb: u64,
    /// How often a throttled worker re-checks resource usage. Default: 250.
    #[serde(default = "defaults::backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_concurrent_tasks: 8,
            max_retries: 3,
            memory_limit_mb: 4096,
            cpu_limit_percent: 90.0,
            enable_caching: true,
            cache_ttl_hours: 24,
            enable_compression: true,
            compression_quality: 85,
            retry_base_delay_ms: defaults::retry_base_delay_ms(),
            retry_max_delay_ms: defaults::retry_max_delay_ms(),
            max_image_size: defaults::max_image_size(),
            large_file_threshold_mb: defaults::large_file_threshold_mb(),
            backpressure_poll_ms: defaults::backpressure_poll_ms(),
        }
    }
}

/// Scoring and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityConfig {
    /// Overall score an attempt must reach to be accepted without a
    /// quality retry. Range: [0, 1]. Default: 0.7.
    pub min_confidence_threshold: f64,
    /// Use history success rates when ranking profiles.
    pub enable_quality_prediction: bool,
    pub enable_auto_retry: bool,
    /// Quality-driven retry budget per task. Range: 0–10. Default: 2.
    pub max_retry_attempts: u32,
    /// Margin a later attempt needs over the best one to replace it.
    /// Range: [0, 1]. Default: 0.05.
    pub quality_improvement_threshold: f64,
    /// Retry on the same profile with adjusted settings when no stronger
    /// profile exists.
    pub enable_fallback_strategies: bool,
    pub enable_hybrid_ocr: bool,
    #[serde(default)]
    pub score_weights: ScoreWeights,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.7,
            enable_quality_prediction: true,
            enable_auto_retry: true,
            max_retry_attempts: 2,
            quality_improvement_threshold: 0.05,
            enable_fallback_strategies: true,
            enable_hybrid_ocr: false,
            score_weights: ScoreWeights::default(),
        }
    }
}

/// How profile ranking trades speed for quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Lighter profiles for large files, otherwise no bias. (default)
    #[default]
    Auto,
    /// Lighter resource classes first.
    Speed,
    /// Heavier resource classes first, hybrid OCR on.
    Quality,
    /// No resource-class bias.
    Balanced,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Auto => "auto",
            Strategy::Speed => "speed",
            Strategy::Quality => "quality",
            Strategy::Balanced => "balanced",
        };
        f.write_str(s)
    }
}

/// Shape of the files the CLI writes for each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `<name>.md` with the extracted text. (default)
    #[default]
    Markdown,
    /// `<name>.txt` with markdown markup left in place.
    Text,
    /// `<name>.json` with text, metrics and telemetry.
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserPreferences {
    /// Pins every file to this profile when it supports the file.
    pub preferred_model: Option<String>,
    pub preferred_strategy: Strategy,
    /// When false the first compatible profile in priority order is used.
    pub auto_optimize_settings: bool,
    /// Bound of the performance history. Range: 1–100 000. Default: 1000.
    pub max_history_items: usize,
    pub output_format: OutputFormat,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            preferred_model: None,
            preferred_strategy: Strategy::Auto,
            auto_optimize_settings: true,
            max_history_items: crate::history::DEFAULT_MAX_ITEMS,
            output_format: OutputFormat::Markdown,
        }
    }
}

mod defaults {
    pub fn retry_base_delay_ms() -> u64 {
        500
    }
    pub fn retry_max_delay_ms() -> u64 {
        30_000
    }
    pub fn max_image_size() -> u32 {
        2048
    }
    pub fn large_file_threshold_mb() -> u64 {
        20
    }
    pub fn backpressure_poll_ms() -> u64 {
        250
    }
}

// ── Validation ───────────────────────────────────────────────────────────

fn unit_interval(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl ConfigDocument {
    /// Every bound violation in the document. Empty means valid.
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut check = |ok: bool, field: &str, msg: String| {
            if !ok {
                out.push(Violation::new(field, msg));
            }
        };

        let p = &self.performance;
        check(
            (1..=64).contains(&p.max_workers),
            "performance.max_workers",
            format!("must be 1–64, got {}", p.max_workers),
        );
        check(
            (1..=256).contains(&p.max_concurrent_tasks),
            "performance.max_concurrent_tasks",
            format!("must be 1–256, got {}", p.max_concurrent_tasks),
        );
        check(
            p.max_concurrent_tasks >= p.max_workers,
            "performance.max_concurrent_tasks",
            format!(
                "must be at least max_workers ({}), got {}",
                p.max_workers, p.max_concurrent_tasks
            ),
        );
        check(
            p.max_retries <= 10,
            "performance.max_retries",
            format!("must be 0–10, got {}", p.max_retries),
        );
        check(
            p.memory_limit_mb >= 128,
            "performance.memory_limit_mb",
            format!("must be at least 128, got {}", p.memory_limit_mb),
        );
        check(
            p.cpu_limit_percent.is_finite()
                && p.cpu_limit_percent > 0.0
                && p.cpu_limit_percent <= 100.0,
            "performance.cpu_limit_percent",
            format!("must be within (0, 100], got {}", p.cpu_limit_percent),
        );
        check(
            (1..=720).contains(&p.cache_ttl_hours),
            "performance.cache_ttl_hours",
            format!("must be 1–720, got {}", p.cache_ttl_hours),
        );
        check(
            (1..=100).contains(&p.compression_quality),
            "performance.compression_quality",
            format!("must be 1–100, got {}", p.compression_quality),
        );
        check(
            p.retry_base_delay_ms <= p.retry_max_delay_ms,
            "performance.retry_base_delay_ms",
            format!(
                "must not exceed retry_max_delay_ms ({}), got {}",
                p.retry_max_delay_ms, p.retry_base_delay_ms
            ),
        );
        check(
            (256..=8192).contains(&p.max_image_size),
            "performance.max_image_size",
            format!("must be 256–8192, got {}", p.max_image_size),
        );
        check(
            (1..=MAX_SIZE_MB).contains(&p.large_file_threshold_mb),
            "performance.large_file_threshold_mb",
            format!("must be 1–{MAX_SIZE_MB}, got {}", p.large_file_threshold_mb),
        );
        check(
            p.backpressure_poll_ms >= 1,
            "performance.backpressure_poll_ms",
            "must be at least 1".to_string(),
        );

        let q = &self.quality;
        check(
            unit_interval(q.min_confidence_threshold),
            "quality.min_confidence_threshold",
            format!("must be within [0, 1], got {}", q.min_confidence_threshold),
        );
        check(
            unit_interval(q.quality_improvement_threshold),
            "quality.quality_improvement_threshold",
            format!(
                "must be within [0, 1], got {}",
                q.quality_improvement_threshold
            ),
        );
        check(
            q.max_retry_attempts <= 10,
            "quality.max_retry_attempts",
            format!("must be 0–10, got {}", q.max_retry_attempts),
        );
        for (name, w) in q.score_weights.named() {
            check(
                w.is_finite() && w >= 0.0,
                &format!("quality.score_weights.{name}"),
                format!("must be finite and non-negative, got {w}"),
            );
        }

        let u = &self.user_preferences;
        check(
            (1..=crate::history::MAX_HISTORY_ITEMS).contains(&u.max_history_items),
            "user_preferences.max_history_items",
            format!(
                "must be 1–{}, got {}",
                crate::history::MAX_HISTORY_ITEMS,
                u.max_history_items
            ),
        );
        if let Some(model) = &u.preferred_model {
            check(
                self.models.contains_key(model),
                "user_preferences.preferred_model",
                format!("'{model}' is not a registered profile"),
            );
        }

        check(
            !self.models.is_empty(),
            "models",
            "at least one model profile is required".to_string(),
        );
        for (name, m) in &self.models {
            check(
                m.temperature.is_finite() && (0.0..=2.0).contains(&m.temperature),
                &format!("models.{name}.temperature"),
                format!("must be within [0, 2], got {}", m.temperature),
            );
            check(
                m.max_tokens >= 1,
                &format!("models.{name}.max_tokens"),
                "must be at least 1".to_string(),
            );
            check(
                m.timeout_secs >= 1,
                &format!("models.{name}.timeout_secs"),
                "must be at least 1".to_string(),
            );
            if let Some(mb) = m.max_file_size_mb {
                check(
                    (1..=MAX_SIZE_MB).contains(&mb),
                    &format!("models.{name}.max_file_size_mb"),
                    format!("must be 1–{MAX_SIZE_MB}, got {mb}"),
                );
            }
            check(
                !m.model.trim().is_empty(),
                &format!("models.{name}.model"),
                "must not be empty".to_string(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ConfigDocument::default().validate().is_empty());
    }

    #[test]
    fn every_violation_is_reported() {
        let mut doc = ConfigDocument::default();
        doc.performance.max_workers = 0;
        doc.quality.min_confidence_threshold = 1.5;
        doc.user_preferences.preferred_model = Some("nope".into());

        let fields: Vec<String> = doc.validate().into_iter().map(|v| v.field).collect();
        assert!(fields.contains(&"performance.max_workers".to_string()));
        assert!(fields.contains(&"quality.min_confidence_threshold".to_string()));
        assert!(fields.contains(&"user_preferences.preferred_model".to_string()));
    }

    #[test]
    fn concurrency_cap_must_cover_workers() {
        let mut doc = ConfigDocument::default();
        doc.performance.max_workers = 16;
        doc.performance.max_concurrent_tasks = 8;
        let v = doc.validate();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "performance.max_concurrent_tasks");
    }

    #[test]
    fn size_settings_are_bounded() {
        let mut doc = ConfigDocument::default();
        doc.performance.large_file_threshold_mb = 1 << 44;
        if let Some(m) = doc.models.get_mut("gpt-4.1") {
            m.max_file_size_mb = Some(u64::MAX);
        }
        let fields: Vec<String> = doc.validate().into_iter().map(|v| v.field).collect();
        assert_eq!(
            fields,
            vec![
                "performance.large_file_threshold_mb".to_string(),
                "models.gpt-4.1.max_file_size_mb".to_string(),
            ]
        );
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let mut json = serde_json::to_value(ConfigDocument::default()).unwrap();
        json["performance"]
            .as_object_mut()
            .unwrap()
            .remove("max_workers");
        assert!(serde_json::from_value::<ConfigDocument>(json).is_err());
    }

    #[test]
    fn supplementary_fields_default_when_absent() {
        let mut json = serde_json::to_value(ConfigDocument::default()).unwrap();
        json["performance"]
            .as_object_mut()
            .unwrap()
            .remove("retry_base_delay_ms");
        let doc: ConfigDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc.performance.retry_base_delay_ms, 500);
    }
}
