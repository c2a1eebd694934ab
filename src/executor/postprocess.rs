//! Deterministic markdown cleanup of raw model output.
//!
//! Vision models wrap answers in fences, emit CRLF, pad lines, and leave
//! zero-width characters behind. None of that is content, and all of it
//! skews the quality features, so it is removed before scoring.

use once_cell::sync::Lazy;
use regex::Regex;

static OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:markdown|md)?\s*\n(.*?)\n```\s*$").unwrap());
static EXCESS_BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static HALLUCINATED_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\((?:https?://)?(?:example\.com|image\.png|placeholder)[^)]*\)").unwrap());

const INVISIBLE: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{00AD}'];

/// Apply every cleanup rule in order.
pub fn clean_markdown(input: &str) -> String {
    let mut text = input.replace("\r\n", "\n").replace('\r', "\n");

    if let Some(caps) = OUTER_FENCE.captures(&text) {
        text = caps[1].to_string();
    }

    text.retain(|c| !INVISIBLE.contains(&c));
    let text = HALLUCINATED_IMAGE.replace_all(&text, "");

    let mut out = String::with_capacity(text.len());
    let mut last_blank = true;
    for line in text.lines() {
        let line = line.trim_end();
        // Headings need a blank line above to render.
        if line.starts_with('#') && !last_blank {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
        last_blank = line.is_empty();
    }

    let out = EXCESS_BLANKS.replace_all(&out, "\n\n");
    let trimmed = out.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}
