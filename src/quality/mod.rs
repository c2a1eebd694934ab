//! Quality assessment of converted text without ground truth.
//!
//! The pipeline is feature extraction → three sub-scores → weighted overall
//! score, confidence and recommendations:
//!
//! * **text plausibility**: is it text at all? Character classes, word
//!   shapes, and length against what the page area should hold.
//! * **structural completeness**: were the regions the document is expected
//!   to contain (tables, forms, handwriting) actually produced?
//! * **efficiency**: wall time against what the profile should need for a
//!   file of this size.
//!
//! ## Why it never fails
//! A quality opinion only steers retries. Blocking the pipeline on a scoring
//! error would cost more than a pessimistic guess, so malformed input yields
//! a minimal-confidence result instead of an error.

mod features;
pub mod recommend;

pub use features::{extract, TextFeatures};

use crate::types::{DocumentMetadata, ProcessingInfo, QualityMetrics, QualitySubScores};
use serde::{Deserialize, Serialize};

/// Confidence reported for degenerate input.
pub const MIN_CONFIDENCE: f64 = 0.1;

/// Relative weights of the sub-scores in the overall score. Normalised by
/// their sum; all-zero weights fall back to an equal split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub text_plausibility: f64,
    pub structural_completeness: f64,
    pub efficiency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            text_plausibility: 0.5,
            structural_completeness: 0.3,
            efficiency: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn named(&self) -> [(&'static str, f64); 3] {
        [
            ("text_plausibility", self.text_plausibility),
            ("structural_completeness", self.structural_completeness),
            ("efficiency", self.efficiency),
        ]
    }

    fn normalised(&self) -> [f64; 3] {
        let raw = [
            self.text_plausibility,
            self.structural_completeness,
            self.efficiency,
        ]
        .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
        let sum: f64 = raw.iter().sum();
        if sum <= 0.0 {
            [1.0 / 3.0; 3]
        } else {
            raw.map(|w| w / sum)
        }
    }
}

/// Anything that can score a conversion attempt. The batch engine takes one
/// as `Arc<dyn QualityAssessor>`.
pub trait QualityAssessor: Send + Sync {
    fn analyze_ocr_quality(
        &self,
        metadata: &DocumentMetadata,
        info: &ProcessingInfo,
        extracted_text: &str,
    ) -> QualityMetrics;
}

/// Heuristic analyzer. Pure: holds only its weighting policy.
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    weights: ScoreWeights,
    /// Minimum expected characters per square inch of page area.
    chars_per_sq_in: f64,
    /// Minimum expected characters per page when the area is unknown.
    chars_per_page: f64,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new(ScoreWeights::default())
    }
}

fn unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl QualityAnalyzer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            weights,
            chars_per_sq_in: 8.0,
            chars_per_page: 150.0,
        }
    }

    pub fn with_expected_density(mut self, chars_per_sq_in: f64, chars_per_page: f64) -> Self {
        self.chars_per_sq_in = chars_per_sq_in.max(0.0);
        self.chars_per_page = chars_per_page.max(0.0);
        self
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    fn expected_min_chars(&self, metadata: &DocumentMetadata, info: &ProcessingInfo) -> f64 {
        let area = info.page_area_sq_in.or(metadata.page_area_sq_in);
        match area {
            Some(a) if a.is_finite() && a > 0.0 => a * self.chars_per_sq_in,
            _ => {
                let pages = info.page_count.max(metadata.page_count).max(1);
                pages as f64 * self.chars_per_page
            }
        }
    }

    fn text_plausibility(&self, f: &TextFeatures, expected_min: f64) -> f64 {
        let visible = f.non_whitespace();
        if visible == 0 {
            return 0.0;
        }
        let visible = visible as f64;
        let garbage_penalty = 1.0 - (f.garbage as f64 / visible) * 5.0;
        let alnum_ratio = (f.letters + f.digits) as f64 / visible;
        let char_class = unit(garbage_penalty) * unit(alnum_ratio / 0.6);

        let word_shape = if f.words == 0 {
            0.0
        } else {
            f.plausible_words as f64 / f.words as f64
        };

        let length = if expected_min <= 0.0 {
            1.0
        } else {
            unit(visible / expected_min)
        };
        unit(char_class * word_shape * length)
    }

    fn structural_completeness(&self, f: &TextFeatures, metadata: &DocumentMetadata) -> f64 {
        let a = &metadata.analysis;
        let checks: Vec<bool> = [
            a.has_tables.then(|| f.has_table()),
            a.has_forms.then(|| f.has_form()),
            a.has_handwriting.then(|| f.non_whitespace() > 0),
        ]
        .into_iter()
        .flatten()
        .collect();

        if !checks.is_empty() {
            let found = checks.iter().filter(|&&ok| ok).count();
            return found as f64 / checks.len() as f64;
        }
        if f.non_empty_lines == 0 {
            return 0.0;
        }
        let mut score: f64 = 0.6;
        if f.headings > 0 || f.list_items > 0 || f.has_table() {
            score += 0.2;
        }
        if f.paragraphs >= 2 {
            score += 0.2;
        }
        unit(score)
    }

    fn efficiency(&self, info: &ProcessingInfo) -> f64 {
        match info.expected_duration_ms {
            Some(expected) if info.duration_ms == 0 => {
                if expected > 0 {
                    1.0
                } else {
                    0.5
                }
            }
            Some(expected) => unit(expected as f64 / info.duration_ms as f64),
            None => 0.5,
        }
    }
}

impl QualityAssessor for QualityAnalyzer {
    fn analyze_ocr_quality(
        &self,
        metadata: &DocumentMetadata,
        info: &ProcessingInfo,
        extracted_text: &str,
    ) -> QualityMetrics {
        let features = extract(extracted_text);
        let expected_min = self.expected_min_chars(metadata, info);

        let sub = QualitySubScores {
            text_plausibility: self.text_plausibility(&features, expected_min),
            structural_completeness: self.structural_completeness(&features, metadata),
            efficiency: self.efficiency(info),
        };
        let w = self.weights.normalised();
        let scores = sub.as_array();
        let overall = unit(scores.iter().zip(w.iter()).map(|(s, w)| s * w).sum());

        let degenerate = features.non_whitespace() == 0
            || metadata.size_bytes == 0
            || metadata.page_area_sq_in.map(|a| !a.is_finite()).unwrap_or(false)
            || info.page_area_sq_in.map(|a| !a.is_finite()).unwrap_or(false);
        let confidence = if degenerate {
            MIN_CONFIDENCE
        } else {
            let mean = scores.iter().sum::<f64>() / 3.0;
            let var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / 3.0;
            unit(1.0 - 2.0 * var.sqrt()).max(MIN_CONFIDENCE)
        };

        let recommendations = recommend::recommendations(&recommend::Inputs {
            metadata,
            info,
            features: &features,
            sub,
            overall,
            confidence,
        });

        QualityMetrics {
            overall_score: overall,
            confidence,
            sub_scores: sub,
            recommendations,
        }
    }
}
