//! In-memory result cache for the VLM executor.
//!
//! Keyed by SHA-256 over the file content, the provider/model pair and the
//! hybrid flag, so a renamed copy of a file hits while a different model or
//! mode misses. Entries expire after `cache_ttl_hours`; past the entry cap the
//! oldest entry is evicted first.

use super::ConvertOutput;
use crate::registry::ModelProfile;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Entry cap used unless [`ResultCache::with_capacity`] sets another.
pub const DEFAULT_CACHE_ENTRIES: usize = 256;

#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, (Instant, ConvertOutput)>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            capacity: DEFAULT_CACHE_ENTRIES,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn from_hours(hours: u64) -> Self {
        Self::new(Duration::from_secs(hours.saturating_mul(3600)))
    }

    pub fn key(bytes: &[u8], profile: &ModelProfile, hybrid: bool) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hasher.update([0u8]);
        hasher.update(profile.provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(profile.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(profile.prompt_template.as_bytes());
        hasher.update([hybrid as u8]);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<ConvertOutput> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((at, out)) if at.elapsed() < self.ttl => {
                debug!(key = %&key[..12.min(key.len())], "Result cache hit");
                Some(out.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, output: ConvertOutput) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
        while entries.len() >= self.capacity && !entries.contains_key(&key) {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
        entries.insert(key, (Instant::now(), output));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_profiles;
    use crate::types::ProcessingInfo;

    fn output() -> ConvertOutput {
        ConvertOutput {
            extracted_text: "# Cached\n".into(),
            info: ProcessingInfo::default(),
        }
    }

    #[test]
    fn key_depends_on_content_model_and_mode() {
        let profiles = default_profiles();
        let a = &profiles["minicpm-v"];
        let b = &profiles["llava-13b"];
        let k = ResultCache::key(b"abc", a, false);
        assert_eq!(k, ResultCache::key(b"abc", a, false));
        assert_ne!(k, ResultCache::key(b"abd", a, false));
        assert_ne!(k, ResultCache::key(b"abc", b, false));
        assert_ne!(k, ResultCache::key(b"abc", a, true));
        assert_eq!(k.len(), 64);
    }

    #[test]
    fn entries_expire() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.insert("k".into(), output());
        assert!(cache.get("k").is_none());

        let cache = ResultCache::from_hours(1);
        cache.insert("k".into(), output());
        assert_eq!(cache.get("k"), Some(output()));
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let cache = ResultCache::from_hours(1).with_capacity(2);
        cache.insert("a".into(), output());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), output());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".into(), output());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some() && cache.get("c").is_some());

        // Replacing an existing key does not evict anything.
        cache.insert("c".into(), output());
        assert_eq!(cache.len(), 2);
    }
}
