//! Environment overrides for the configuration document.
//!
//! Every leaf of the document can be set from a variable named
//! `DOCBATCH_<SECTION>_<FIELD>`, e.g. `DOCBATCH_PERFORMANCE_MAX_WORKERS=8` or
//! `DOCBATCH_QUALITY_SCORE_WEIGHTS_EFFICIENCY=0.1`. Profiles are addressed as
//! `DOCBATCH_MODELS_<NAME>_<FIELD>` where `<NAME>` is the profile name
//! upper-cased with non-alphanumerics written as `_`.
//!
//! Overrides are applied to the JSON form of the document, so the mapping
//! follows the document's shape without a hand-maintained table. Each value
//! is parsed according to the type of the leaf it replaces.

use super::ConfigDocument;
use crate::error::ConfigError;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "DOCBATCH_";

/// Normalised form of a document key as it appears in a variable name.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Find the leaf addressed by `suffix` under `obj`, trying longer keys first
/// so `MAX_RETRY_ATTEMPTS` never resolves through a shorter prefix.
fn locate<'a>(obj: &'a mut Map<String, Value>, suffix: &str) -> Option<&'a mut Value> {
    let mut keys: Vec<String> = obj.keys().cloned().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let mut target: Option<(String, Option<String>)> = None;
    for key in keys {
        let ek = env_key(&key);
        let is_object = obj.get(&key).map(Value::is_object).unwrap_or(false);
        if is_object {
            if let Some(rest) = suffix.strip_prefix(&ek).and_then(|r| r.strip_prefix('_')) {
                target = Some((key, Some(rest.to_string())));
                break;
            }
        } else if suffix == ek {
            target = Some((key, None));
            break;
        }
    }

    let (key, rest) = target?;
    let value = obj.get_mut(&key)?;
    match rest {
        Some(rest) => locate(value.as_object_mut()?, &rest),
        None => Some(value),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `raw` into a value of the same JSON type as `current`.
fn parse_like(current: &Value, raw: &str) -> Result<Value, String> {
    let raw_trim = raw.trim();
    match current {
        Value::Bool(_) => parse_bool(raw_trim)
            .map(Value::Bool)
            .ok_or_else(|| "expected a boolean (true/false/1/0)".to_string()),
        Value::Number(n) if n.is_u64() => raw_trim
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| "expected an unsigned integer".to_string()),
        Value::Number(n) if n.is_i64() => raw_trim
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| "expected an integer".to_string()),
        Value::Number(_) => raw_trim
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| "expected a finite number".to_string()),
        Value::Array(_) => Ok(Value::Array(
            raw_trim
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        // Optional fields: empty clears, numeric text is tried as a number
        // first (see `apply_env_overrides`), anything else is a string.
        Value::Null if raw_trim.is_empty() => Ok(Value::Null),
        Value::Null => Ok(raw_trim
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string()))),
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Object(_) => Err("cannot override a whole section".to_string()),
    }
}

/// Apply `DOCBATCH_*` variables from `vars` to `doc`.
///
/// Variables that address no known field are logged and ignored. A value
/// that cannot be parsed, or that makes the document unreadable (for
/// instance an unknown strategy name), fails with [`ConfigError::Env`].
/// Bound checks are left to [`ConfigDocument::validate`].
pub fn apply_env_overrides<I, K, V>(doc: ConfigDocument, vars: I) -> Result<ConfigDocument, ConfigError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut vars: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(k, _)| k.as_ref().starts_with(ENV_PREFIX))
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    if vars.is_empty() {
        return Ok(doc);
    }
    // Deterministic application order.
    vars.sort();

    let mut json = serde_json::to_value(&doc).map_err(|e| ConfigError::Env {
        var: ENV_PREFIX.to_string(),
        value: String::new(),
        detail: e.to_string(),
    })?;

    for (var, raw) in vars {
        let suffix = &var[ENV_PREFIX.len()..];
        let Some(root) = json.as_object_mut() else {
            break;
        };
        let names_section = root
            .keys()
            .any(|k| suffix.starts_with(&format!("{}_", env_key(k))));
        let Some(slot) = locate(root, suffix) else {
            // Variables outside the four sections belong to front ends
            // (e.g. DOCBATCH_OUTPUT_DIR for the CLI).
            if names_section {
                warn!(var = %var, "Ignoring environment override: no such configuration field");
            }
            continue;
        };
        let was_null = slot.is_null();
        let parsed = parse_like(slot, &raw).map_err(|detail| ConfigError::Env {
            var: var.clone(),
            value: raw.clone(),
            detail,
        })?;
        let numeric_guess = was_null && parsed.is_number();
        *slot = parsed;

        // Catch enum and type mismatches while the culprit is still known.
        let mut check = serde_json::from_value::<ConfigDocument>(json.clone());
        if check.is_err() && numeric_guess {
            // An unset optional string that happens to look like a number.
            if let Some(slot) = json.as_object_mut().and_then(|root| locate(root, suffix)) {
                *slot = Value::String(raw.clone());
            }
            check = serde_json::from_value::<ConfigDocument>(json.clone());
        }
        if let Err(e) = check {
            return Err(ConfigError::Env {
                var,
                value: raw,
                detail: e.to_string(),
            });
        }
        debug!(var = %var, "Applied environment override");
    }

    serde_json::from_value(json).map_err(|e| ConfigError::Env {
        var: ENV_PREFIX.to_string(),
        value: String::new(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;

    fn apply(vars: &[(&str, &str)]) -> Result<ConfigDocument, ConfigError> {
        apply_env_overrides(ConfigDocument::default(), vars.iter().copied())
    }

    #[test]
    fn overrides_section_leaves() {
        let doc = apply(&[
            ("DOCBATCH_PERFORMANCE_MAX_WORKERS", "12"),
            ("DOCBATCH_PERFORMANCE_MAX_CONCURRENT_TASKS", "24"),
            ("DOCBATCH_QUALITY_ENABLE_AUTO_RETRY", "false"),
            ("DOCBATCH_QUALITY_MIN_CONFIDENCE_THRESHOLD", "0.55"),
            ("DOCBATCH_USER_PREFERENCES_PREFERRED_STRATEGY", "speed"),
        ])
        .unwrap();
        assert_eq!(doc.performance.max_workers, 12);
        assert_eq!(doc.performance.max_concurrent_tasks, 24);
        assert!(!doc.quality.enable_auto_retry);
        assert!((doc.quality.min_confidence_threshold - 0.55).abs() < 1e-9);
        assert_eq!(doc.user_preferences.preferred_strategy, Strategy::Speed);
    }

    #[test]
    fn similar_names_resolve_to_the_exact_leaf() {
        let doc = apply(&[
            ("DOCBATCH_QUALITY_MAX_RETRY_ATTEMPTS", "5"),
            ("DOCBATCH_PERFORMANCE_MAX_RETRIES", "1"),
        ])
        .unwrap();
        assert_eq!(doc.quality.max_retry_attempts, 5);
        assert_eq!(doc.performance.max_retries, 1);
    }

    #[test]
    fn overrides_nested_weights_and_profiles() {
        let doc = apply(&[
            ("DOCBATCH_QUALITY_SCORE_WEIGHTS_EFFICIENCY", "0"),
            ("DOCBATCH_MODELS_LLAMA3_2_VISION_TIMEOUT_SECS", "300"),
            ("DOCBATCH_MODELS_MINICPM_V_CAPABILITIES", "text, tables"),
        ])
        .unwrap();
        assert_eq!(doc.quality.score_weights.efficiency, 0.0);
        assert_eq!(doc.models["llama3.2-vision"].timeout_secs, 300);
        assert_eq!(doc.models["minicpm-v"].capabilities.len(), 2);
    }

    #[test]
    fn optional_string_can_be_set() {
        let doc = apply(&[("DOCBATCH_USER_PREFERENCES_PREFERRED_MODEL", "minicpm-v")]).unwrap();
        assert_eq!(doc.user_preferences.preferred_model.as_deref(), Some("minicpm-v"));
    }

    #[test]
    fn unset_optional_leaves_can_be_overridden() {
        let doc = apply(&[
            ("DOCBATCH_MODELS_GPT_4_1_MAX_FILE_SIZE_MB", "5"),
            ("DOCBATCH_USER_PREFERENCES_PREFERRED_MODEL", "2024"),
        ])
        .unwrap();
        assert_eq!(doc.models["gpt-4.1"].max_file_size_mb, Some(5));
        assert_eq!(doc.user_preferences.preferred_model.as_deref(), Some("2024"));

        // Unset leaves still appear in the serialized document.
        let json = serde_json::to_value(ConfigDocument::default()).unwrap();
        assert!(json["models"]["gpt-4.1"]["max_file_size_mb"].is_null());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = apply(&[("DOCBATCH_PERFORMANCE_MAX_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "DOCBATCH_PERFORMANCE_MAX_WORKERS"));

        let err = apply(&[("DOCBATCH_USER_PREFERENCES_PREFERRED_STRATEGY", "fastest")]).unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn unrelated_and_unknown_variables_are_ignored() {
        let doc = apply(&[("HOME", "/root"), ("DOCBATCH_PERFORMANCE_NOPE", "1")]).unwrap();
        assert_eq!(doc, ConfigDocument::default());
    }
}
