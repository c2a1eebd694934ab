//! Shared data model: file references, detected characteristics, resolved
//! settings and quality metrics.
//!
//! These are plain value types. The batch engine owns the mutable task and
//! job state (see [`crate::batch`]); everything here is either immutable once
//! built or copied per task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ── File references ──────────────────────────────────────────────────────

/// Where a file's bytes come from. Immutable for the lifetime of a task.
#[derive(Clone)]
pub enum FileSource {
    /// A file on the local file system.
    Path(PathBuf),
    /// An in-memory buffer, e.g. an upload already held by a front end.
    Buffer { name: String, bytes: Arc<[u8]> },
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            FileSource::Buffer { name, bytes } => f
                .debug_struct("Buffer")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// A file submitted to a batch job.
///
/// `id` is the file's identity inside the job: results are keyed by it, so
/// it must be unique per job. It defaults to the path (or buffer name).
#[derive(Debug, Clone)]
pub struct FileRef {
    pub id: String,
    pub source: FileSource,
    /// Caller-supplied traits (e.g. "this is a form") merged with detection.
    pub hints: BTreeSet<CapabilityTag>,
}

impl FileRef {
    /// Reference a local file. The id is the path as given.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: path.display().to_string(),
            source: FileSource::Path(path),
            hints: BTreeSet::new(),
        }
    }

    /// Reference an in-memory buffer. The id is the buffer name.
    pub fn buffer(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            source: FileSource::Buffer {
                name,
                bytes: bytes.into(),
            },
            hints: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_hint(mut self, tag: CapabilityTag) -> Self {
        self.hints.insert(tag);
        self
    }

    /// File name used for extension and keyword heuristics.
    pub fn name(&self) -> &str {
        match &self.source {
            FileSource::Path(p) => p.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            FileSource::Buffer { name, .. } => name,
        }
    }

    /// Load the full contents. Buffers are shared, not copied.
    pub async fn read_bytes(&self) -> std::io::Result<Arc<[u8]>> {
        match &self.source {
            FileSource::Path(p) => Ok(tokio::fs::read(p).await?.into()),
            FileSource::Buffer { bytes, .. } => Ok(Arc::clone(bytes)),
        }
    }

    /// Size in bytes and up to the first 16 bytes for magic sniffing.
    pub(crate) async fn probe(&self) -> std::io::Result<(u64, Vec<u8>)> {
        match &self.source {
            FileSource::Path(p) => {
                use tokio::io::AsyncReadExt;
                let meta = tokio::fs::metadata(p).await?;
                if !meta.is_file() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("'{}' is not a regular file", p.display()),
                    ));
                }
                let mut head = vec![0u8; 16];
                let mut file = tokio::fs::File::open(p).await?;
                let n = file.read(&mut head).await?;
                head.truncate(n);
                Ok((meta.len(), head))
            }
            FileSource::Buffer { bytes, .. } => {
                Ok((bytes.len() as u64, bytes.iter().take(16).copied().collect()))
            }
        }
    }
}

// ── File type detection ──────────────────────────────────────────────────

/// Coarse document family, enough to pick a conversion path and a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Image,
    Text,
    Office,
    Unknown,
}

impl FileType {
    /// Detect from leading bytes first, falling back to the file extension.
    pub fn detect(name: &str, head: &[u8]) -> Self {
        Self::from_magic(head).unwrap_or_else(|| Self::from_extension(name))
    }

    fn from_magic(head: &[u8]) -> Option<Self> {
        const IMAGE_MAGIC: &[&[u8]] = &[
            b"\x89PNG",
            b"\xFF\xD8\xFF",
            b"GIF8",
            b"II*\0",
            b"MM\0*",
            b"BM",
        ];
        if head.starts_with(b"%PDF") {
            return Some(FileType::Pdf);
        }
        if IMAGE_MAGIC.iter().any(|m| head.starts_with(m)) {
            return Some(FileType::Image);
        }
        if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
            return Some(FileType::Image);
        }
        if head.starts_with(b"PK\x03\x04") {
            return Some(FileType::Office);
        }
        None
    }

    /// Detect from the file extension alone (case-insensitive).
    pub fn from_extension(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => FileType::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "tif" | "tiff" | "bmp" | "webp" => FileType::Image,
            "txt" | "md" | "markdown" | "csv" | "html" | "htm" => FileType::Text,
            "docx" | "xlsx" | "pptx" | "odt" | "rtf" | "epub" | "doc" => FileType::Office,
            _ => FileType::Unknown,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Pdf => "pdf",
            FileType::Image => "image",
            FileType::Text => "text",
            FileType::Office => "office",
            FileType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ── Capabilities and characteristics ─────────────────────────────────────

/// Suitability tag shared by profiles (what they handle well) and files
/// (what they contain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityTag {
    Text,
    Tables,
    Forms,
    Handwriting,
    Scanned,
    Photos,
    LargeDocuments,
}

/// Filename keywords that hint at document content.
const TRAIT_KEYWORDS: &[(&str, CapabilityTag)] = &[
    ("form", CapabilityTag::Forms),
    ("invoice", CapabilityTag::Forms),
    ("receipt", CapabilityTag::Forms),
    ("table", CapabilityTag::Tables),
    ("spreadsheet", CapabilityTag::Tables),
    ("scan", CapabilityTag::Scanned),
    ("handwrit", CapabilityTag::Handwriting),
    ("note", CapabilityTag::Handwriting),
    ("photo", CapabilityTag::Photos),
];

/// Megabytes to bytes, saturating at `u64::MAX`.
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// What the configuration layer knows about a file when choosing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCharacteristics {
    pub file_type: Option<FileType>,
    pub size_bytes: u64,
    pub traits: BTreeSet<CapabilityTag>,
}

impl FileCharacteristics {
    pub fn new(file_type: FileType, size_bytes: u64) -> Self {
        Self {
            file_type: Some(file_type),
            size_bytes,
            traits: BTreeSet::new(),
        }
    }

    pub fn with_traits(mut self, traits: impl IntoIterator<Item = CapabilityTag>) -> Self {
        self.traits.extend(traits);
        self
    }

    /// Characteristics of a named file: hints, filename keywords, type and size.
    pub fn detect(
        name: &str,
        file_type: FileType,
        size_bytes: u64,
        hints: &BTreeSet<CapabilityTag>,
        large_threshold_mb: u64,
    ) -> Self {
        let lower = name.to_ascii_lowercase();
        let mut traits: BTreeSet<CapabilityTag> = hints.clone();
        for (keyword, tag) in TRAIT_KEYWORDS {
            if lower.contains(keyword) {
                traits.insert(*tag);
            }
        }
        if file_type == FileType::Image {
            traits.insert(CapabilityTag::Photos);
        }
        if large_threshold_mb > 0 && size_bytes > mb_to_bytes(large_threshold_mb) {
            traits.insert(CapabilityTag::LargeDocuments);
        }
        Self {
            file_type: Some(file_type),
            size_bytes,
            traits,
        }
    }

    /// No type, no size, no traits: ranking falls back to declared order.
    pub fn is_empty(&self) -> bool {
        self.file_type.is_none() && self.size_bytes == 0 && self.traits.is_empty()
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

// ── Resolved settings ────────────────────────────────────────────────────

/// Settings resolved for one task. A value type: produced fresh per task
/// and never shared mutably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Name of the model profile to call.
    pub profile: String,
    /// Combine the vision pass with a text-layer extraction pass.
    pub hybrid_ocr: bool,
    /// Minimum overall quality score accepted without a quality retry.
    pub quality_threshold: f64,
    /// Longest image edge, in pixels, sent to the model.
    pub max_image_size: u32,
    pub enable_compression: bool,
    /// JPEG quality (1–100) when compression is enabled.
    pub compression_quality: u8,
    /// Profile timeout before the multiplier is applied.
    pub base_timeout_secs: u64,
    pub timeout_multiplier: f64,
    /// Task-wide budget for retries after transient collaborator failures.
    pub max_retries: u32,
    /// Task-wide budget for quality-driven retries.
    pub max_retry_attempts: u32,
    pub enable_auto_retry: bool,
}

impl ProcessingSettings {
    /// Effective per-call timeout: `base_timeout_secs × timeout_multiplier`.
    pub fn timeout(&self) -> Duration {
        let secs = self.base_timeout_secs as f64 * self.timeout_multiplier;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs(self.base_timeout_secs.max(1))
        }
    }
}

// ── Quality ──────────────────────────────────────────────────────────────

/// Per-dimension scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySubScores {
    pub text_plausibility: f64,
    pub structural_completeness: f64,
    pub efficiency: f64,
}

impl QualitySubScores {
    pub fn as_array(&self) -> [f64; 3] {
        [
            self.text_plausibility,
            self.structural_completeness,
            self.efficiency,
        ]
    }
}

/// Heuristic quality opinion on one conversion attempt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall_score: f64,
    pub confidence: f64,
    pub sub_scores: QualitySubScores,
    pub recommendations: Vec<String>,
}

/// Region expectations derived from detected traits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    pub has_tables: bool,
    pub has_forms: bool,
    pub has_handwriting: bool,
}

impl DocumentAnalysis {
    pub fn from_traits(traits: &BTreeSet<CapabilityTag>) -> Self {
        Self {
            has_tables: traits.contains(&CapabilityTag::Tables),
            has_forms: traits.contains(&CapabilityTag::Forms),
            has_handwriting: traits.contains(&CapabilityTag::Handwriting),
        }
    }
}

/// Document facts handed to the quality analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_type: Option<FileType>,
    pub size_bytes: u64,
    pub page_count: usize,
    /// Total page area in square inches, when the collaborator knows it.
    pub page_area_sq_in: Option<f64>,
    pub analysis: DocumentAnalysis,
}

/// Telemetry reported by the collaborator for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub profile: String,
    pub duration_ms: u64,
    /// What this profile is expected to take for this file; filled in by
    /// the engine when the collaborator leaves it empty.
    pub expected_duration_ms: Option<u64>,
    pub page_count: usize,
    pub page_area_sq_in: Option<f64>,
    pub hybrid_used: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Served from the result cache without calling the model.
    pub cached: bool,
}
