//! Feature extraction over converted markdown.

use once_cell::sync::Lazy;
use regex::Regex;

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+\S").unwrap());
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\|.*\|\s*$").unwrap());
static TABLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$").unwrap());
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,3}[.)])\s+\S").unwrap());
static FORM_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\*\*[^*]{1,60}:?\*\*:?|[A-Z][A-Za-z /#]{1,40}:)\s*").unwrap());
static CHECKBOX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(?: |x|X)\]").unwrap());

/// Counts gathered in one pass over the text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextFeatures {
    pub chars: usize,
    pub letters: usize,
    pub digits: usize,
    pub whitespace: usize,
    pub punctuation: usize,
    /// Replacement characters, control characters and private-use glyphs.
    pub garbage: usize,
    pub words: usize,
    /// Words that look like natural-language tokens.
    pub plausible_words: usize,
    pub lines: usize,
    pub non_empty_lines: usize,
    /// Runs of non-empty lines separated by blank lines.
    pub paragraphs: usize,
    pub headings: usize,
    pub table_rows: usize,
    pub table_separators: usize,
    pub list_items: usize,
    pub form_fields: usize,
    pub checkboxes: usize,
}

impl TextFeatures {
    pub fn non_whitespace(&self) -> usize {
        self.chars - self.whitespace
    }

    pub fn has_table(&self) -> bool {
        self.table_rows >= 2 && self.table_separators >= 1
    }

    pub fn has_form(&self) -> bool {
        self.form_fields > 0 || self.checkboxes > 0
    }
}

fn is_garbage(c: char) -> bool {
    c == '\u{FFFD}'
        || (c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        || ('\u{E000}'..='\u{F8FF}').contains(&c)
}

/// A token reads like a word: mostly letters, sensible length, no glyph soup.
fn is_plausible_word(word: &str) -> bool {
    let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
    if trimmed.is_empty() {
        return false;
    }
    let len = trimmed.chars().count();
    if len > 25 {
        return false;
    }
    let alpha = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    let digit = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
    // Pure numbers ("2024", "42.00") are fine; mixed soup like "l1I0o" is not.
    digit == len || alpha * 10 >= len * 7 || (alpha + digit == len && alpha <= 3)
}

pub fn extract(text: &str) -> TextFeatures {
    let mut f = TextFeatures::default();
    for c in text.chars() {
        f.chars += 1;
        if c.is_whitespace() {
            f.whitespace += 1;
        } else if c.is_alphabetic() {
            f.letters += 1;
        } else if c.is_numeric() {
            f.digits += 1;
        } else if is_garbage(c) {
            f.garbage += 1;
        } else {
            f.punctuation += 1;
        }
    }

    for word in text.split_whitespace() {
        f.words += 1;
        if is_plausible_word(word) {
            f.plausible_words += 1;
        }
    }

    let mut in_paragraph = false;
    for line in text.lines() {
        f.lines += 1;
        if line.trim().is_empty() {
            in_paragraph = false;
            continue;
        }
        f.non_empty_lines += 1;
        if !in_paragraph {
            f.paragraphs += 1;
            in_paragraph = true;
        }
        if HEADING.is_match(line) {
            f.headings += 1;
        }
        if TABLE_SEPARATOR.is_match(line) && line.contains('-') {
            f.table_separators += 1;
        } else if TABLE_ROW.is_match(line) {
            f.table_rows += 1;
        }
        if LIST_ITEM.is_match(line) {
            f.list_items += 1;
        }
        if FORM_FIELD.is_match(line) && !HEADING.is_match(line) {
            f.form_fields += 1;
        }
        f.checkboxes += CHECKBOX.find_iter(line).count();
    }
    f
}
