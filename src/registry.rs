//! Model profile registry: named inference configurations.
//!
//! Profiles live inside the persisted configuration document under the
//! `models` key, so the registry is reloaded, exported and overridden with the
//! rest of the configuration. At job creation the engine takes an
//! `Arc` snapshot of the whole document; a profile edit therefore only reaches
//! jobs created after it.

use crate::prompts;
use crate::types::{mb_to_bytes, CapabilityTag, FileType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Relative memory/time cost of a profile. Ordered: `Light < Standard < Heavy`.
///
/// Escalation after a low-quality attempt always moves to a strictly higher
/// class, so the ordering bounds how many escalations can happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Light,
    Standard,
    Heavy,
}

impl ResourceClass {
    /// Expected wall-clock time for a file of `size_bytes`, used by the
    /// quality analyzer's efficiency score.
    pub fn expected_duration_ms(&self, size_bytes: u64) -> u64 {
        let (base_ms, per_mb_ms) = match self {
            ResourceClass::Light => (3_000.0, 4_000.0),
            ResourceClass::Standard => (5_000.0, 8_000.0),
            ResourceClass::Heavy => (8_000.0, 15_000.0),
        };
        let mb = size_bytes as f64 / (1024.0 * 1024.0);
        (base_ms + per_mb_ms * mb).round() as u64
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceClass::Light => "light",
            ResourceClass::Standard => "standard",
            ResourceClass::Heavy => "heavy",
        };
        f.write_str(s)
    }
}

/// A named inference profile: which model, how to prompt it, and what it is
/// good at. Read-only while jobs run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Provider name understood by `edgequake_llm::ProviderFactory`
    /// (e.g. "ollama", "openai").
    pub provider: String,
    /// Model identifier sent to the provider.
    pub model: String,
    pub capabilities: BTreeSet<CapabilityTag>,
    /// File types this profile accepts. Empty means all.
    #[serde(default)]
    pub file_types: BTreeSet<FileType>,
    pub resource_class: ResourceClass,
    pub max_tokens: usize,
    pub temperature: f32,
    pub prompt_template: String,
    pub timeout_secs: u64,
    /// Declared order; lower comes first when everything else ties.
    pub priority: u32,
    /// Largest file this profile should be given, in MB. Range: 1–1 048 576.
    #[serde(default)]
    pub max_file_size_mb: Option<u64>,
}

impl ModelProfile {
    pub fn supports(&self, file_type: FileType) -> bool {
        self.file_types.is_empty() || self.file_types.contains(&file_type)
    }

    pub fn accepts_size(&self, size_bytes: u64) -> bool {
        self.max_file_size_mb
            .map(|mb| size_bytes <= mb_to_bytes(mb))
            .unwrap_or(true)
    }

    /// Number of `traits` this profile is tagged for.
    pub fn tag_overlap(&self, traits: &BTreeSet<CapabilityTag>) -> usize {
        self.capabilities.intersection(traits).count()
    }
}

/// Profiles in declared order: priority, then name.
pub fn ordered<'a>(
    models: &'a BTreeMap<String, ModelProfile>,
) -> Vec<(&'a str, &'a ModelProfile)> {
    let mut list: Vec<(&str, &ModelProfile)> =
        models.iter().map(|(n, p)| (n.as_str(), p)).collect();
    list.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then_with(|| a.0.cmp(b.0)));
    list
}

/// Built-in catalogue: local Ollama vision models from light to heavy, plus a
/// hosted high-capacity profile at the top.
pub fn default_profiles() -> BTreeMap<String, ModelProfile> {
    use CapabilityTag::*;
    let visual: BTreeSet<FileType> = [FileType::Pdf, FileType::Image].into();

    let mut models = BTreeMap::new();
    models.insert(
        "llama3.2-vision".to_string(),
        ModelProfile {
            provider: "ollama".into(),
            model: "llama3.2-vision:latest".into(),
            capabilities: [Text, Tables, Scanned].into(),
            file_types: visual.clone(),
            resource_class: ResourceClass::Standard,
            max_tokens: 4096,
            temperature: 0.1,
            prompt_template: prompts::DEFAULT_PROMPT.into(),
            timeout_secs: 120,
            priority: 0,
            max_file_size_mb: None,
        },
    );
    models.insert(
        "minicpm-v".to_string(),
        ModelProfile {
            provider: "ollama".into(),
            model: "minicpm-v:latest".into(),
            capabilities: [Text, Photos, LargeDocuments].into(),
            file_types: visual.clone(),
            resource_class: ResourceClass::Light,
            max_tokens: 2048,
            temperature: 0.1,
            prompt_template: prompts::DEFAULT_PROMPT.into(),
            timeout_secs: 90,
            priority: 1,
            max_file_size_mb: None,
        },
    );
    models.insert(
        "llava-13b".to_string(),
        ModelProfile {
            provider: "ollama".into(),
            model: "llava:13b".into(),
            capabilities: [Text, Handwriting, Photos].into(),
            file_types: visual.clone(),
            resource_class: ResourceClass::Heavy,
            max_tokens: 4096,
            temperature: 0.1,
            prompt_template: prompts::HANDWRITING_PROMPT.into(),
            timeout_secs: 180,
            priority: 2,
            max_file_size_mb: Some(50),
        },
    );
    models.insert(
        "gpt-4.1".to_string(),
        ModelProfile {
            provider: "openai".into(),
            model: "gpt-4.1".into(),
            capabilities: [Text, Tables, Forms, Handwriting, Scanned].into(),
            file_types: visual,
            resource_class: ResourceClass::Heavy,
            max_tokens: 8192,
            temperature: 0.0,
            prompt_template: prompts::FORMS_PROMPT.into(),
            timeout_secs: 120,
            priority: 3,
            max_file_size_mb: None,
        },
    );
    models
}
