use super::cache::ResultCache;
use super::encode::{encode_image, fit_to};
use super::postprocess::clean_markdown;
use super::render::{decode_image, extract_text_layer, render_pdf, PageImage, RenderedDocument};
use super::{ConvertOutput, ConvertRequest, TaskExecutor};
use crate::config::ConfigDocument;
use crate::error::ExecutorError;
use crate::prompts::{hybrid_context, render_prompt};
use crate::registry::ModelProfile;
use crate::types::{FileType, ProcessingInfo};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pages of one document converted at once.
const DEFAULT_PAGE_CONCURRENCY: usize = 4;

/// Message fragments of provider errors that retrying cannot fix.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "authentication",
    "api key",
    "api_key",
    "404",
    "model not found",
    "model_not_found",
    "does not exist",
    "try pulling it",
];
const UNSUPPORTED_MARKERS: &[&str] = &[
    "content filter",
    "content_filter",
    "content policy",
    "invalid request",
    "invalid_request",
    "400 bad request",
    "does not support image",
    "not supported",
];
const TRANSIENT_MARKERS: &[&str] = &["429", "rate limit", "rate_limit", "too many requests"];

/// Map a provider error message onto the executor taxonomy. Rate limits and
/// anything unrecognised stay transient.
fn classify_chat_error(message: String) -> ExecutorError {
    let lower = message.to_ascii_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if has(TRANSIENT_MARKERS) {
        ExecutorError::Transport(message)
    } else if has(UNAVAILABLE_MARKERS) {
        ExecutorError::Unavailable(message)
    } else if has(UNSUPPORTED_MARKERS) {
        ExecutorError::Unsupported(message)
    } else {
        ExecutorError::Transport(message)
    }
}

/// Result of one page's vision call.
struct PageText {
    markdown: String,
    input_tokens: usize,
    output_tokens: usize,
    used_text_layer: bool,
}

/// Vision-model collaborator.
///
/// Providers are created lazily per (provider, model) pair through
/// `ProviderFactory`, which reads API keys from the environment, and reused
/// across calls. A pre-built provider passed to
/// [`with_provider`](Self::with_provider) replaces the factory for every
/// profile, which is how tests inject mocks.
pub struct VlmExecutor {
    providers: Mutex<HashMap<(String, String), Arc<dyn LLMProvider>>>,
    fixed_provider: Option<Arc<dyn LLMProvider>>,
    cache: Option<ResultCache>,
    page_concurrency: usize,
    text_fast_path: bool,
}

impl Default for VlmExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VlmExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmExecutor")
            .field("fixed_provider", &self.fixed_provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("cache", &self.cache.as_ref().map(|c| c.len()))
            .field("page_concurrency", &self.page_concurrency)
            .field("text_fast_path", &self.text_fast_path)
            .finish()
    }
}

impl VlmExecutor {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            fixed_provider: None,
            cache: None,
            page_concurrency: DEFAULT_PAGE_CONCURRENCY,
            text_fast_path: true,
        }
    }

    /// Executor with caching set up from `performance.enable_caching` and
    /// `performance.cache_ttl_hours`.
    pub fn from_config(doc: &ConfigDocument) -> Self {
        let mut exec = Self::new();
        if doc.performance.enable_caching {
            exec.cache = Some(ResultCache::from_hours(doc.performance.cache_ttl_hours));
        }
        exec
    }

    pub fn with_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.fixed_provider = Some(provider);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_page_concurrency(mut self, n: usize) -> Self {
        self.page_concurrency = n.max(1);
        self
    }

    /// Return the embedded text of text-based PDFs without a model call
    /// (on by default). Hybrid-OCR attempts always go through the model.
    pub fn with_text_fast_path(mut self, enabled: bool) -> Self {
        self.text_fast_path = enabled;
        self
    }

    fn provider_for(&self, profile: &ModelProfile) -> Result<Arc<dyn LLMProvider>, ExecutorError> {
        if let Some(p) = &self.fixed_provider {
            return Ok(Arc::clone(p));
        }
        let key = (profile.provider.clone(), profile.model.clone());
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = providers.get(&key) {
            return Ok(Arc::clone(p));
        }
        let provider = ProviderFactory::create_llm_provider(&profile.provider, &profile.model)
            .map_err(|e| {
                ExecutorError::Unavailable(format!(
                    "provider '{}' with model '{}' is not configured: {e}",
                    profile.provider, profile.model
                ))
            })?;
        info!(provider = %profile.provider, model = %profile.model, "Created vision provider");
        providers.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    async fn convert_page(
        &self,
        provider: &Arc<dyn LLMProvider>,
        request: &ConvertRequest,
        page: PageImage,
        total_pages: usize,
    ) -> Result<PageText, ExecutorError> {
        let settings = &request.settings;
        let profile = &request.profile;
        let page_num = page.index + 1;

        let image = fit_to(page.image, settings.max_image_size);
        let quality = settings
            .enable_compression
            .then_some(settings.compression_quality);
        let image_data = encode_image(&image, quality).map_err(|e| {
            ExecutorError::Unsupported(format!("page {page_num} could not be encoded: {e}"))
        })?;

        let mut messages = vec![ChatMessage::system(render_prompt(
            &profile.prompt_template,
            page_num,
            total_pages,
        ))];
        let mut used_text_layer = false;
        if settings.hybrid_ocr {
            if let Some(text) = page.text_layer.as_deref() {
                messages.push(ChatMessage::system(hybrid_context(text)));
                used_text_layer = true;
            }
        }
        messages.push(ChatMessage::user_with_images("", vec![image_data]));

        let options = CompletionOptions {
            temperature: Some(profile.temperature),
            max_tokens: Some(profile.max_tokens),
            ..Default::default()
        };

        let response = provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| {
                let err = classify_chat_error(e.to_string());
                warn!(page = page_num, error = %e, permanent = err.is_permanent(), "Vision call failed");
                err
            })?;
        debug!(
            page = page_num,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "Page converted"
        );

        Ok(PageText {
            markdown: clean_markdown(&response.content),
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
            used_text_layer,
        })
    }
}

#[async_trait]
impl TaskExecutor for VlmExecutor {
    async fn convert(&self, request: ConvertRequest) -> Result<ConvertOutput, ExecutorError> {
        let start = Instant::now();
        let bytes = request.file.read_bytes().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ExecutorError::Unsupported(format!("{}: {e}", request.file.id))
            }
            _ => ExecutorError::Transport(format!("{}: {e}", request.file.id)),
        })?;

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ResultCache::key(&bytes, &request.profile, request.settings.hybrid_ocr));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(mut hit) = cache.get(key) {
                hit.info.cached = true;
                hit.info.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(hit);
            }
        }

        if request.file_type == FileType::Pdf && self.text_fast_path && !request.settings.hybrid_ocr {
            if let Some(layer) = extract_text_layer(Arc::clone(&bytes)).await? {
                info!(file_id = %request.file.id, pages = layer.pages.len(), "Using the PDF text layer");
                let output = ConvertOutput {
                    extracted_text: clean_markdown(&layer.pages.join("\n\n")),
                    info: ProcessingInfo {
                        profile: request.settings.profile.clone(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        page_count: layer.pages.len(),
                        page_area_sq_in: layer.page_area_sq_in,
                        ..Default::default()
                    },
                };
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.insert(key, output.clone());
                }
                return Ok(output);
            }
        }

        let document: RenderedDocument = match request.file_type {
            FileType::Text => {
                let text = clean_markdown(&String::from_utf8_lossy(&bytes));
                return Ok(ConvertOutput {
                    extracted_text: text,
                    info: ProcessingInfo {
                        profile: request.settings.profile.clone(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        page_count: 1,
                        ..Default::default()
                    },
                });
            }
            FileType::Pdf => {
                render_pdf(
                    Arc::clone(&bytes),
                    request.settings.max_image_size,
                    request.settings.hybrid_ocr,
                )
                .await?
            }
            FileType::Image => decode_image(Arc::clone(&bytes)).await?,
            other => {
                return Err(ExecutorError::Unsupported(format!(
                    "{}: no conversion path for {other} files",
                    request.file.id
                )))
            }
        };

        let provider = self.provider_for(&request.profile)?;
        let total_pages = document.pages.len();
        let page_area_sq_in = document.page_area_sq_in;

        let results: Vec<Result<PageText, ExecutorError>> = stream::iter(document.pages)
            .map(|page| self.convert_page(&provider, &request, page, total_pages))
            .buffered(self.page_concurrency)
            .collect()
            .await;

        let mut pages = Vec::with_capacity(results.len());
        for r in results {
            pages.push(r?);
        }

        let extracted_text = pages
            .iter()
            .map(|p| p.markdown.trim_end())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let info = ProcessingInfo {
            profile: request.settings.profile.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            expected_duration_ms: None,
            page_count: total_pages,
            page_area_sq_in,
            hybrid_used: pages.iter().any(|p| p.used_text_layer),
            input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
            output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
            cached: false,
        };
        let output = ConvertOutput {
            extracted_text,
            info,
        };

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.insert(key, output.clone());
        }
        Ok(output)
    }

    async fn is_available(&self, _profile_name: &str, profile: &ModelProfile) -> bool {
        self.provider_for(profile).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_profiles;
    use crate::types::{FileRef, ProcessingSettings};
    use std::time::Duration;

    fn request(file: FileRef, file_type: FileType) -> ConvertRequest {
        let profile = default_profiles().remove("minicpm-v").unwrap();
        ConvertRequest {
            file,
            file_type,
            settings: ProcessingSettings {
                profile: "minicpm-v".into(),
                hybrid_ocr: false,
                quality_threshold: 0.7,
                max_image_size: 1024,
                enable_compression: true,
                compression_quality: 85,
                base_timeout_secs: profile.timeout_secs,
                timeout_multiplier: 1.0,
                max_retries: 0,
                max_retry_attempts: 0,
                enable_auto_retry: false,
            },
            profile,
            timeout: Duration::from_secs(30),
            attempt: 1,
        }
    }

    #[test]
    fn chat_errors_are_classified() {
        let classify = |m: &str| classify_chat_error(m.to_string());
        assert!(matches!(
            classify("Authentication failed: invalid API key"),
            ExecutorError::Unavailable(_)
        ));
        assert!(matches!(
            classify("model 'llava:13b' not found, try pulling it first"),
            ExecutorError::Unavailable(_)
        ));
        assert!(matches!(
            classify("Request blocked by content filter"),
            ExecutorError::Unsupported(_)
        ));
        assert!(matches!(
            classify("HTTP 429: rate limit exceeded, retry after 2s"),
            ExecutorError::Transport(_)
        ));
        assert!(matches!(
            classify("connection reset by peer"),
            ExecutorError::Transport(_)
        ));
        assert!(classify("403 Forbidden").is_permanent());
    }

    #[tokio::test]
    async fn text_files_pass_through() {
        let exec = VlmExecutor::new();
        let file = FileRef::buffer("notes.md", b"# Notes\r\n\r\nplain text  \r\n".to_vec());
        let out = exec.convert(request(file, FileType::Text)).await.unwrap();
        assert_eq!(out.extracted_text, "# Notes\n\nplain text\n");
        assert_eq!(out.info.page_count, 1);
    }

    #[tokio::test]
    async fn office_files_are_unsupported() {
        let exec = VlmExecutor::new();
        let file = FileRef::buffer("memo.docx", b"PK\x03\x04rest".to_vec());
        let err = exec.convert(request(file, FileType::Office)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unsupported(_)));
    }

    #[tokio::test]
    async fn cached_text_result_is_flagged() {
        let exec = VlmExecutor::new().with_cache(ResultCache::from_hours(1));
        let file = FileRef::buffer("a.txt", b"hello".to_vec());
        // No provider is configured here, so a hit is the only way to succeed.
        let req = request(file, FileType::Image);
        let key = ResultCache::key(b"hello", &req.profile, false);
        exec.cache.as_ref().unwrap().insert(
            key,
            ConvertOutput {
                extracted_text: "hello\n".into(),
                info: ProcessingInfo::default(),
            },
        );
        let out = exec.convert(req).await.unwrap();
        assert!(out.info.cached);
        assert_eq!(out.extracted_text, "hello\n");
    }
}
