//! Rule-based recommendations attached to [`QualityMetrics`](crate::types::QualityMetrics).

use super::features::TextFeatures;
use crate::types::{DocumentMetadata, ProcessingInfo, QualitySubScores};

pub const ENABLE_HYBRID_OCR: &str =
    "Enable hybrid OCR: combine the vision pass with text-layer extraction";
pub const REDUCE_IMAGE_SIZE: &str =
    "Reduce max image size: processing was slow for a large file";
pub const HIGHER_CAPACITY_PROFILE: &str =
    "Retry with a higher-capacity model profile: extracted text looks implausible";
pub const TABLE_PROFILE: &str =
    "Use a table-capable profile: expected tables were not found in the output";
pub const FORM_PROFILE: &str =
    "Use a form-capable profile: expected form fields were not found in the output";
pub const CHECK_SOURCE: &str =
    "No text was extracted: check that the source file is readable and not blank";
pub const MANUAL_REVIEW: &str =
    "Low confidence in this assessment: manual review recommended";

const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;

pub(super) struct Inputs<'a> {
    pub metadata: &'a DocumentMetadata,
    pub info: &'a ProcessingInfo,
    pub features: &'a TextFeatures,
    pub sub: QualitySubScores,
    pub overall: f64,
    pub confidence: f64,
}

pub(super) fn recommendations(i: &Inputs<'_>) -> Vec<String> {
    let mut out: Vec<&'static str> = Vec::new();

    if i.features.non_whitespace() == 0 {
        out.push(CHECK_SOURCE);
    }
    if i.overall < 0.5 && !i.info.hybrid_used {
        out.push(ENABLE_HYBRID_OCR);
    }
    if i.sub.efficiency < 0.4 && i.metadata.size_bytes > LARGE_FILE_BYTES {
        out.push(REDUCE_IMAGE_SIZE);
    }
    if i.sub.text_plausibility < 0.5 {
        out.push(HIGHER_CAPACITY_PROFILE);
    }
    if i.metadata.analysis.has_tables && !i.features.has_table() {
        out.push(TABLE_PROFILE);
    }
    if i.metadata.analysis.has_forms && !i.features.has_form() {
        out.push(FORM_PROFILE);
    }
    if i.confidence < 0.5 {
        out.push(MANUAL_REVIEW);
    }
    out.into_iter().map(str::to_string).collect()
}
