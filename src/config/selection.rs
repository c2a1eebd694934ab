//! Profile ranking and settings resolution.
//!
//! Pure functions of (document, characteristics, history): the same inputs
//! always produce the same ranking, so repeated calls for one file agree.

use super::{ConfigDocument, Strategy};
use crate::history::PerformanceHistory;
use crate::registry::{self, ModelProfile};
use crate::types::{mb_to_bytes, CapabilityTag, FileCharacteristics, ProcessingSettings};
use std::cmp::Ordering;

/// Longest timeout stretch applied to large files.
const MAX_LARGE_FILE_MULTIPLIER: f64 = 3.0;
/// Longest timeout stretch a fallback retry may reach.
const MAX_FALLBACK_MULTIPLIER: f64 = 4.0;

/// Outcome of asking for a stronger profile after a low-quality attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Retry with this profile; its resource class is strictly higher.
    Profile(String),
    /// Nothing stronger supports this file.
    NoEscalation,
}

fn compatible(p: &ModelProfile, ch: &FileCharacteristics) -> bool {
    ch.file_type.map(|t| p.supports(t)).unwrap_or(true) && p.accepts_size(ch.size_bytes)
}

fn is_large(doc: &ConfigDocument, ch: &FileCharacteristics) -> bool {
    ch.traits.contains(&CapabilityTag::LargeDocuments)
        || ch.size_bytes > mb_to_bytes(doc.performance.large_file_threshold_mb)
}

/// Success rate used as a tie-breaker; unknown pairs rank as neutral.
fn predicted_rate(
    doc: &ConfigDocument,
    history: &PerformanceHistory,
    name: &str,
    ch: &FileCharacteristics,
) -> f64 {
    if !doc.quality.enable_quality_prediction {
        return 0.0;
    }
    ch.file_type
        .and_then(|t| history.success_rate(name, t))
        .unwrap_or(0.5)
}

/// Compatible profiles, best first.
///
/// Order: capability overlap, then resource-class bias (lighter first for
/// large files or the speed strategy, heavier first for the quality
/// strategy), then predicted success rate, then priority, then name.
pub(crate) fn rank_profiles(
    doc: &ConfigDocument,
    ch: &FileCharacteristics,
    history: &PerformanceHistory,
) -> Vec<String> {
    let strategy = doc.user_preferences.preferred_strategy;
    let lighter_first = strategy == Strategy::Speed || (strategy == Strategy::Auto && is_large(doc, ch));
    let heavier_first = strategy == Strategy::Quality;

    let mut ranked: Vec<(&str, &ModelProfile, usize, f64)> = registry::ordered(&doc.models)
        .into_iter()
        .filter(|(_, p)| compatible(p, ch))
        .map(|(n, p)| (n, p, p.tag_overlap(&ch.traits), predicted_rate(doc, history, n, ch)))
        .collect();

    ranked.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then_with(|| {
                if lighter_first {
                    a.1.resource_class.cmp(&b.1.resource_class)
                } else if heavier_first {
                    b.1.resource_class.cmp(&a.1.resource_class)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| b.3.total_cmp(&a.3))
            .then_with(|| a.1.priority.cmp(&b.1.priority))
            .then_with(|| a.0.cmp(b.0))
    });
    ranked.into_iter().map(|(n, ..)| n.to_string()).collect()
}

/// Profile names for a file, best first: capability overlap, then history
/// success rate, then priority. Empty characteristics give declared order.
pub(crate) fn recommend(
    doc: &ConfigDocument,
    ch: &FileCharacteristics,
    history: &PerformanceHistory,
) -> Vec<String> {
    let ordered = registry::ordered(&doc.models);
    if ch.is_empty() {
        return ordered.into_iter().map(|(n, _)| n.to_string()).collect();
    }
    let mut list: Vec<(&str, &ModelProfile, usize, f64)> = ordered
        .into_iter()
        .filter(|(_, p)| ch.file_type.map(|t| p.supports(t)).unwrap_or(true))
        .map(|(n, p)| {
            let rate = ch
                .file_type
                .and_then(|t| history.success_rate(n, t))
                .unwrap_or(0.0);
            (n, p, p.tag_overlap(&ch.traits), rate)
        })
        .collect();
    list.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then_with(|| b.3.total_cmp(&a.3))
            .then_with(|| a.1.priority.cmp(&b.1.priority))
            .then_with(|| a.0.cmp(b.0))
    });
    list.into_iter().map(|(n, ..)| n.to_string()).collect()
}

/// Pick the profile for a file.
///
/// A compatible preferred model wins. Without auto-optimisation the first
/// compatible profile in priority order is used. If nothing is compatible the
/// first declared profile is returned and the collaborator decides.
fn choose_profile(
    doc: &ConfigDocument,
    ch: &FileCharacteristics,
    history: &PerformanceHistory,
) -> String {
    if let Some(name) = &doc.user_preferences.preferred_model {
        if doc.models.get(name).map(|p| compatible(p, ch)).unwrap_or(false) {
            return name.clone();
        }
    }
    let ordered = registry::ordered(&doc.models);
    if !doc.user_preferences.auto_optimize_settings {
        if let Some((n, _)) = ordered.iter().find(|(_, p)| compatible(p, ch)) {
            return n.to_string();
        }
    } else if let Some(best) = rank_profiles(doc, ch, history).into_iter().next() {
        return best;
    }
    ordered
        .first()
        .map(|(n, _)| n.to_string())
        .unwrap_or_default()
}

/// Settings for one file under `profile`, before any job-level override.
pub(crate) fn settings_for_profile(
    doc: &ConfigDocument,
    profile: &str,
    ch: &FileCharacteristics,
) -> ProcessingSettings {
    let p = &doc.performance;
    let q = &doc.quality;
    let base_timeout_secs = doc
        .models
        .get(profile)
        .map(|m| m.timeout_secs)
        .unwrap_or(60);

    let mut s = ProcessingSettings {
        profile: profile.to_string(),
        hybrid_ocr: q.enable_hybrid_ocr,
        quality_threshold: q.min_confidence_threshold,
        max_image_size: p.max_image_size,
        enable_compression: p.enable_compression,
        compression_quality: p.compression_quality,
        base_timeout_secs,
        timeout_multiplier: 1.0,
        max_retries: p.max_retries,
        max_retry_attempts: q.max_retry_attempts,
        enable_auto_retry: q.enable_auto_retry,
    };

    match doc.user_preferences.preferred_strategy {
        Strategy::Quality => s.hybrid_ocr = true,
        Strategy::Speed => s.enable_compression = true,
        Strategy::Auto | Strategy::Balanced => {}
    }

    if is_large(doc, ch) {
        let threshold_mb = p.large_file_threshold_mb.max(1) as f64;
        let ratio = ch.size_mb() / threshold_mb;
        s.timeout_multiplier = (1.0 + 0.5 * ratio).clamp(1.5, MAX_LARGE_FILE_MULTIPLIER);
        s.compression_quality = s.compression_quality.saturating_sub(10).max(50).min(p.compression_quality);
        s.max_image_size = (s.max_image_size * 3 / 4).max(256).min(p.max_image_size);
        s.enable_compression = true;
    }
    s
}

pub(crate) fn resolve(
    doc: &ConfigDocument,
    ch: &FileCharacteristics,
    history: &PerformanceHistory,
) -> ProcessingSettings {
    let profile = choose_profile(doc, ch, history);
    settings_for_profile(doc, &profile, ch)
}

/// First profile in the recommendation list whose resource class is strictly
/// above `current`'s and that accepts the file's size.
pub(crate) fn escalate(
    doc: &ConfigDocument,
    current: &str,
    ch: &FileCharacteristics,
    history: &PerformanceHistory,
) -> Escalation {
    let Some(current_class) = doc.models.get(current).map(|p| p.resource_class) else {
        return Escalation::NoEscalation;
    };
    recommend(doc, ch, history)
        .into_iter()
        .find(|n| {
            doc.models
                .get(n.as_str())
                .map(|p| p.resource_class > current_class && p.accepts_size(ch.size_bytes))
                .unwrap_or(false)
        })
        .map(Escalation::Profile)
        .unwrap_or(Escalation::NoEscalation)
}

/// Same-profile retry settings when no stronger profile exists: hybrid OCR
/// on and a longer timeout. `None` once nothing is left to adjust.
pub fn fallback_settings(current: &ProcessingSettings) -> Option<ProcessingSettings> {
    let multiplier = (current.timeout_multiplier * 1.5).min(MAX_FALLBACK_MULTIPLIER);
    if current.hybrid_ocr && multiplier <= current.timeout_multiplier {
        return None;
    }
    let mut next = current.clone();
    next.hybrid_ocr = true;
    next.timeout_multiplier = multiplier;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{AttemptOutcome, PerformanceRecord};
    use crate::registry::ResourceClass;
    use crate::types::FileType;

    fn history() -> PerformanceHistory {
        PerformanceHistory::default()
    }

    #[test]
    fn traits_drive_profile_choice() {
        let doc = ConfigDocument::default();
        let ch = FileCharacteristics::new(FileType::Pdf, 1024)
            .with_traits([CapabilityTag::Forms, CapabilityTag::Handwriting]);
        assert_eq!(resolve(&doc, &ch, &history()).profile, "gpt-4.1");
    }

    #[test]
    fn resolution_is_deterministic() {
        let doc = ConfigDocument::default();
        let h = history();
        let ch = FileCharacteristics::new(FileType::Image, 3 * 1024 * 1024)
            .with_traits([CapabilityTag::Photos]);
        let first = resolve(&doc, &ch, &h);
        for _ in 0..10 {
            assert_eq!(resolve(&doc, &ch, &h), first);
        }
    }

    #[test]
    fn preferred_model_pins_when_compatible() {
        let mut doc = ConfigDocument::default();
        doc.user_preferences.preferred_model = Some("llava-13b".into());
        let small = FileCharacteristics::new(FileType::Pdf, 1024);
        assert_eq!(resolve(&doc, &small, &history()).profile, "llava-13b");

        // Too large for the pinned profile: falls back to ranking.
        let huge = FileCharacteristics::new(FileType::Pdf, 60 * 1024 * 1024);
        assert_ne!(resolve(&doc, &huge, &history()).profile, "llava-13b");
    }

    #[test]
    fn large_files_get_longer_timeouts_and_smaller_images() {
        let doc = ConfigDocument::default();
        let ch = FileCharacteristics::new(FileType::Pdf, 100 * 1024 * 1024);
        let s = resolve(&doc, &ch, &history());
        assert!(s.timeout_multiplier > 1.0 && s.timeout_multiplier <= 3.0);
        assert!(s.max_image_size < doc.performance.max_image_size);
        assert!(s.compression_quality < doc.performance.compression_quality);
    }

    #[test]
    fn history_breaks_ties() {
        let doc = ConfigDocument::default();
        let h = history();
        for _ in 0..4 {
            h.record(PerformanceRecord::new(
                "llama3.2-vision",
                FileType::Image,
                AttemptOutcome::TransientFailure,
                None,
                10,
            ));
            h.record(PerformanceRecord::new(
                "minicpm-v",
                FileType::Image,
                AttemptOutcome::Success,
                Some(0.9),
                10,
            ));
        }
        // Both overlap on `text` only.
        let ch = FileCharacteristics::new(FileType::Image, 1024).with_traits([CapabilityTag::Text]);
        assert_eq!(recommend(&doc, &ch, &h)[0], "minicpm-v");
    }

    #[test]
    fn empty_characteristics_give_declared_order() {
        let doc = ConfigDocument::default();
        let names = recommend(&doc, &FileCharacteristics::default(), &history());
        assert_eq!(names, vec!["llama3.2-vision", "minicpm-v", "llava-13b", "gpt-4.1"]);
    }

    #[test]
    fn escalation_moves_to_strictly_higher_class() {
        let doc = ConfigDocument::default();
        let ch = FileCharacteristics::new(FileType::Pdf, 1024);
        let Escalation::Profile(next) = escalate(&doc, "minicpm-v", &ch, &history()) else {
            panic!("expected an escalation");
        };
        assert_eq!(doc.models[&next].resource_class, ResourceClass::Standard);
        assert_eq!(escalate(&doc, "gpt-4.1", &ch, &history()), Escalation::NoEscalation);
    }

    #[test]
    fn escalation_follows_capability_ranking() {
        let doc = ConfigDocument::default();
        let ch = FileCharacteristics::new(FileType::Pdf, 1024).with_traits([CapabilityTag::Forms]);
        assert_eq!(recommend(&doc, &ch, &history())[0], "gpt-4.1");
        // llama3.2-vision is the lightest stronger class but has no forms tag.
        assert_eq!(
            escalate(&doc, "minicpm-v", &ch, &history()),
            Escalation::Profile("gpt-4.1".into())
        );
    }

    #[test]
    fn escalation_skips_profiles_that_reject_the_size() {
        let mut doc = ConfigDocument::default();
        doc.models.get_mut("gpt-4.1").unwrap().max_file_size_mb = Some(1);
        let ch = FileCharacteristics::new(FileType::Pdf, 4 * 1024 * 1024)
            .with_traits([CapabilityTag::Forms]);
        let Escalation::Profile(next) = escalate(&doc, "minicpm-v", &ch, &history()) else {
            panic!("expected an escalation");
        };
        assert_ne!(next, "gpt-4.1");
    }

    #[test]
    fn huge_large_file_threshold_does_not_overflow() {
        let mut doc = ConfigDocument::default();
        doc.performance.large_file_threshold_mb = 1 << 44;
        let ch = FileCharacteristics::new(FileType::Pdf, 100 * 1024 * 1024);
        let s = resolve(&doc, &ch, &history());
        assert_eq!(s.timeout_multiplier, 1.0);
    }

    #[test]
    fn fallback_turns_on_hybrid_and_caps_timeout() {
        let doc = ConfigDocument::default();
        let mut s = settings_for_profile(&doc, "gpt-4.1", &FileCharacteristics::default());
        let mut steps = 0;
        while let Some(next) = fallback_settings(&s) {
            assert!(next.hybrid_ocr);
            assert!(next.timeout_multiplier <= 4.0);
            s = next;
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(s.timeout_multiplier, 4.0);
    }
}
