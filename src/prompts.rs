//! Prompt templates for the built-in model profiles.
//!
//! Every profile carries its own `prompt_template`; the constants here seed
//! the default registry. Templates may contain `{page}` and `{total_pages}`,
//! substituted per page by [`render_prompt`].

/// General-purpose page transcription prompt.
pub const DEFAULT_PROMPT: &str = r#"You are an expert document converter. Convert the page image ({page} of {total_pages}) to clean, well-structured Markdown.

1. TEXT: preserve all text exactly, in human reading order.
2. STRUCTURE: # for the page title, ## / ### for sections, - and 1. for lists.
3. TABLES: GFM pipe tables with a separator row; HTML only when pipes cannot express the layout.
4. IGNORE: page numbers, running headers and footers, decorative lines.
5. OUTPUT: Markdown only. No ```markdown fences, no commentary."#;

/// Prompt for forms, invoices and receipts: keeps field/value pairing.
pub const FORMS_PROMPT: &str = r#"You are an expert document converter. Convert the page image ({page} of {total_pages}) to Markdown.

1. TEXT: preserve all printed and filled-in text exactly.
2. FORM FIELDS: write each field as `**Label:** value`. Leave the value empty if unfilled.
3. CHECKBOXES: write `[x]` for checked and `[ ]` for unchecked boxes, followed by the label.
4. TABLES: GFM pipe tables with a separator row.
5. OUTPUT: Markdown only. No fences, no commentary."#;

/// Prompt for handwritten notes and photographs of text.
pub const HANDWRITING_PROMPT: &str = r#"You are transcribing a photograph or scan of handwritten text ({page} of {total_pages}).

1. Transcribe every legible word in reading order; keep line breaks between paragraphs.
2. Mark illegible words as [illegible]. Never guess names or numbers.
3. Keep lists and headings when the writer used them.
4. Output Markdown only. No fences, no commentary."#;

/// Substitute page placeholders in a profile template.
pub fn render_prompt(template: &str, page: usize, total_pages: usize) -> String {
    template
        .replace("{page}", &page.to_string())
        .replace("{total_pages}", &total_pages.to_string())
}

/// Context message for hybrid OCR: the page's extracted text layer, which the
/// model uses to check spelling and numbers against what it sees.
pub fn hybrid_context(text_layer: &str) -> String {
    format!(
        "A text-extraction pass over this page produced the text below. It may be \
incomplete or out of order. Use it to confirm words and numbers, but follow the image \
for layout and reading order:\n\n\"\"\"{}\"\"\"",
        text_layer
    )
}
