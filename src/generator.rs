//! Request validation, option merging and artifact writing
//!
//! The generators are the admission surface: they validate the incoming
//! request, merge per-request overrides over the current settings snapshot
//! into an immutable `JobOptions`, and hand the job to the queue. The
//! executor is the other end of the pipeline: it drives the render on a
//! pooled context and persists the result under the configured storage
//! directory.

use crate::filename::{encode_filename, MediaKind};
use crate::queue::{
    BrowserJobOptions, ClipRegion, Job, JobExecutor, JobOptions, JobSource, MediaOptions, NewJob,
    PdfOptions, ProgressReporter, QueueJobOptions, RenderQueue, ScreenshotOptions,
    DEFAULT_PRIORITY,
};
use crate::renderer::{RenderContext, RenderRequest};
use crate::settings::{
    ImageKind, MarginSettings, PageFormat, Settings, SettingsStore, ViewportSettings,
};
use crate::RenderError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Inline HTML larger than this is rejected at admission.
const MAX_HTML_BYTES: usize = 10 * 1024 * 1024;

const MAX_URL_CHARS: usize = 2048;

const MAX_CLIP_DIMENSION: u32 = 10_000;

/// Overrides shared by both media surfaces. Omitted fields fall back to the
/// settings snapshot taken at admission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    pub priority: Option<i32>,
    pub re_create: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub viewport: Option<ViewportSettings>,
    pub processing_timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PdfRequestOptions {
    pub format: Option<PageFormat>,
    pub landscape: Option<bool>,
    pub print_background: Option<bool>,
    pub margin: Option<MarginSettings>,
    pub job: JobOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScreenshotRequestOptions {
    pub kind: Option<ImageKind>,
    pub quality: Option<u8>,
    pub full_page: Option<bool>,
    pub clip: Option<ClipRegion>,
    pub omit_background: Option<bool>,
    pub job: JobOverrides,
}

fn validate_source(source: &JobSource) -> Result<(), RenderError> {
    match source {
        JobSource::Html(html) | JobSource::File(html) => {
            if html.trim().is_empty() {
                return Err(RenderError::Validation(
                    "html content must not be empty".to_string(),
                ));
            }
            if html.len() > MAX_HTML_BYTES {
                return Err(RenderError::Validation(format!(
                    "html content exceeds {} bytes",
                    MAX_HTML_BYTES
                )));
            }
        }
        JobSource::Url(url) => {
            if url.len() > MAX_URL_CHARS {
                return Err(RenderError::Validation(format!(
                    "url exceeds {} characters",
                    MAX_URL_CHARS
                )));
            }
            let parsed = Url::parse(url)
                .map_err(|e| RenderError::Validation(format!("invalid url: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(RenderError::Validation(format!(
                    "url scheme must be http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }
    }
    Ok(())
}

fn validate_overrides(overrides: &JobOverrides) -> Result<(), RenderError> {
    let mut violations = Vec::new();
    if let Some(v) = overrides.timeout_ms {
        if !(1_000..=120_000).contains(&v) {
            violations.push(format!("timeout_ms must be between 1000 and 120000, got {v}"));
        }
    }
    if let Some(v) = overrides.processing_timeout_ms {
        if !(1_000..=600_000).contains(&v) {
            violations.push(format!(
                "processing_timeout_ms must be between 1000 and 600000, got {v}"
            ));
        }
    }
    if let Some(v) = overrides.retry_attempts {
        if v > 5 {
            violations.push(format!("retry_attempts must be at most 5, got {v}"));
        }
    }
    if let Some(v) = overrides.retry_delay_ms {
        if v > 60_000 {
            violations.push(format!("retry_delay_ms must be at most 60000, got {v}"));
        }
    }
    if let Some(viewport) = &overrides.viewport {
        if viewport.width == 0 || viewport.height == 0 {
            violations.push("viewport dimensions must be greater than 0".to_string());
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(RenderError::Validation(violations.join("; ")))
    }
}

fn merge_common(settings: &Settings, overrides: &JobOverrides, media: MediaOptions) -> JobOptions {
    JobOptions {
        browser: BrowserJobOptions {
            timeout_ms: overrides
                .timeout_ms
                .unwrap_or(settings.browser.default_timeout_ms),
            viewport: overrides
                .viewport
                .clone()
                .unwrap_or_else(|| settings.browser.viewport.clone()),
        },
        media,
        queue: QueueJobOptions {
            priority: overrides.priority.unwrap_or(DEFAULT_PRIORITY),
            processing_timeout_ms: overrides
                .processing_timeout_ms
                .unwrap_or(settings.queue.processing_timeout_ms),
            retry_attempts: overrides
                .retry_attempts
                .unwrap_or(settings.queue.retry_attempts),
            retry_delay_ms: overrides
                .retry_delay_ms
                .unwrap_or(settings.queue.retry_delay_ms),
        },
    }
}

/// PDF admission surface.
pub struct PdfGenerator {
    settings: Arc<SettingsStore>,
    queue: RenderQueue,
}

impl PdfGenerator {
    pub fn new(settings: Arc<SettingsStore>, queue: RenderQueue) -> Self {
        Self { settings, queue }
    }

    pub async fn generate_from_html(
        &self,
        requested_key: &str,
        html: String,
        options: PdfRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::Html(html), options)
            .await
    }

    pub async fn generate_from_url(
        &self,
        requested_key: &str,
        url: &str,
        options: PdfRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::Url(url.to_string()), options)
            .await
    }

    /// Uploaded HTML file; the caller has already read it into memory.
    pub async fn generate_from_file(
        &self,
        requested_key: &str,
        content: String,
        options: PdfRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::File(content), options)
            .await
    }

    async fn submit(
        &self,
        requested_key: &str,
        source: JobSource,
        options: PdfRequestOptions,
    ) -> Result<Job, RenderError> {
        validate_source(&source)?;
        validate_overrides(&options.job)?;

        let settings = self.settings.get();
        let media = MediaOptions::Pdf(PdfOptions {
            format: options.format.unwrap_or(settings.pdf.default_format),
            landscape: options.landscape.unwrap_or(settings.pdf.landscape),
            print_background: options
                .print_background
                .unwrap_or(settings.pdf.print_background),
            margin: options
                .margin
                .unwrap_or_else(|| settings.pdf.margin.clone()),
        });

        debug!(key = requested_key, source = source.kind(), "PDF job requested");
        self.queue
            .submit(NewJob {
                requested_key: requested_key.to_string(),
                source,
                options: merge_common(&settings, &options.job, media),
                re_create: options.job.re_create.unwrap_or(false),
            })
            .await
    }
}

/// Screenshot admission surface.
pub struct ScreenshotGenerator {
    settings: Arc<SettingsStore>,
    queue: RenderQueue,
}

impl ScreenshotGenerator {
    pub fn new(settings: Arc<SettingsStore>, queue: RenderQueue) -> Self {
        Self { settings, queue }
    }

    pub async fn generate_from_html(
        &self,
        requested_key: &str,
        html: String,
        options: ScreenshotRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::Html(html), options)
            .await
    }

    pub async fn generate_from_url(
        &self,
        requested_key: &str,
        url: &str,
        options: ScreenshotRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::Url(url.to_string()), options)
            .await
    }

    pub async fn generate_from_file(
        &self,
        requested_key: &str,
        content: String,
        options: ScreenshotRequestOptions,
    ) -> Result<Job, RenderError> {
        self.submit(requested_key, JobSource::File(content), options)
            .await
    }

    async fn submit(
        &self,
        requested_key: &str,
        source: JobSource,
        options: ScreenshotRequestOptions,
    ) -> Result<Job, RenderError> {
        validate_source(&source)?;
        validate_overrides(&options.job)?;

        let settings = self.settings.get();
        let kind = options.kind.unwrap_or(settings.screenshot.default_kind);
        let quality = options.quality.or(if kind == ImageKind::Jpeg {
            settings.screenshot.default_quality
        } else {
            None
        });

        if let Some(quality) = quality {
            if quality > 100 {
                return Err(RenderError::Validation(format!(
                    "quality must be at most 100, got {quality}"
                )));
            }
            if kind != ImageKind::Jpeg {
                return Err(RenderError::Validation(
                    "quality is only valid for jpeg screenshots".to_string(),
                ));
            }
        }
        if let Some(clip) = &options.clip {
            if options.full_page == Some(true) {
                return Err(RenderError::Validation(
                    "clip and full_page are mutually exclusive".to_string(),
                ));
            }
            for (field, value) in [("width", clip.width), ("height", clip.height)] {
                if value == 0 || value > MAX_CLIP_DIMENSION {
                    return Err(RenderError::Validation(format!(
                        "clip {field} must be between 1 and {MAX_CLIP_DIMENSION}, got {value}"
                    )));
                }
            }
        }

        // A clip region implies a viewport capture regardless of the
        // configured full_page default.
        let full_page = if options.clip.is_some() {
            false
        } else {
            options.full_page.unwrap_or(settings.screenshot.full_page)
        };

        let media = MediaOptions::Screenshot(ScreenshotOptions {
            kind,
            quality,
            full_page,
            clip: options.clip,
            omit_background: options.omit_background.unwrap_or(false),
        });

        debug!(
            key = requested_key,
            source = source.kind(),
            "Screenshot job requested"
        );
        self.queue
            .submit(NewJob {
                requested_key: requested_key.to_string(),
                source,
                options: merge_common(&settings, &options.job, media),
                re_create: options.job.re_create.unwrap_or(false),
            })
            .await
    }
}

/// Renders a job on a pooled context and writes the artifact. One executor
/// serves both queues; the storage directory follows the job's media kind.
pub struct RenderExecutor {
    settings: Arc<SettingsStore>,
}

impl RenderExecutor {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }

    fn storage_dir(&self, media: MediaKind) -> PathBuf {
        let settings = self.settings.get();
        match media {
            MediaKind::Pdf => settings.storage.pdf_dir.clone(),
            MediaKind::Png | MediaKind::Jpeg => settings.storage.screenshot_dir.clone(),
        }
    }
}

#[async_trait]
impl JobExecutor for RenderExecutor {
    async fn execute(
        &self,
        job: &Job,
        context: Arc<dyn RenderContext>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, RenderError> {
        progress.set(10).await;

        let request = RenderRequest {
            source: job.source.clone(),
            media: job.options.media.clone(),
            viewport: job.options.browser.viewport.clone(),
        };
        let bytes = context.render(&request, cancel).await?;
        progress.set(80).await;

        let dir = self.storage_dir(job.media);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(encode_filename(&job.requested_key, Utc::now(), job.media));
        tokio::fs::write(&path, &bytes).await?;

        debug!(key = %job.requested_key, path = %path.display(), "Artifact written");
        progress.set(95).await;
        Ok(path)
    }
}
