//! Rendering capability behind the worker pool
//!
//! The queue and pool only know the `RenderContext`/`ContextFactory` traits;
//! the production implementation drives a headless Chromium instance per
//! context over the DevTools protocol.

use crate::queue::{JobSource, MediaOptions};
use crate::settings::{SettingsStore, ViewportSettings};
use crate::RenderError;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, PrintToPdfParams, Viewport as ClipViewport,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MM_PER_INCH: f64 = 25.4;

/// One render invocation: a source document and the merged output options.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub source: JobSource,
    pub media: MediaOptions,
    pub viewport: ViewportSettings,
}

/// A single rendering context owned by exactly one in-flight job at a time.
///
/// `render` must honor the cancellation token; the hard deadline is enforced
/// by the scheduler around the call.
#[async_trait]
pub trait RenderContext: Send + Sync {
    async fn render(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError>;

    /// Checked by the pool on release; unhealthy contexts are discarded.
    fn is_healthy(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn RenderContext>, RenderError>;
}

/// Chromium context: one browser process plus its CDP event handler task.
pub struct ChromiumContext {
    id: usize,
    browser: Mutex<Browser>,
    handler: tokio::task::JoinHandle<()>,
}

impl ChromiumContext {
    async fn render_page(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let page = {
            let browser = self.browser.lock().await;
            match &request.source {
                JobSource::Url(url) => browser
                    .new_page(url.as_str())
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))?,
                JobSource::Html(_) | JobSource::File(_) => browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))?,
            }
        };

        let result = self.render_on_page(&page, request).await;
        let _ = page.close().await;
        result
    }

    async fn render_on_page(
        &self,
        page: &Page,
        request: &RenderRequest,
    ) -> Result<Vec<u8>, RenderError> {
        let viewport = &request.viewport;
        let emulation =
            chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams::builder()
                .width(viewport.width as i64)
                .height(viewport.height as i64)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(RenderError::RenderFailed)?;
        page.execute(emulation)
            .await
            .map_err(|e| RenderError::RenderFailed(e.to_string()))?;

        match &request.source {
            JobSource::Html(html) | JobSource::File(html) => {
                page.set_content(html.as_str())
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))?;
            }
            JobSource::Url(_) => {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))?;
            }
        }

        match &request.media {
            MediaOptions::Pdf(options) => {
                let (width_in, height_in) = options.format.paper_size();
                let params = PrintToPdfParams::builder()
                    .landscape(options.landscape)
                    .print_background(options.print_background)
                    .paper_width(width_in)
                    .paper_height(height_in)
                    .margin_top(options.margin.top_mm / MM_PER_INCH)
                    .margin_bottom(options.margin.bottom_mm / MM_PER_INCH)
                    .margin_left(options.margin.left_mm / MM_PER_INCH)
                    .margin_right(options.margin.right_mm / MM_PER_INCH)
                    .build();
                page.pdf(params)
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))
            }
            MediaOptions::Screenshot(options) => {
                let format = match options.kind {
                    crate::settings::ImageKind::Png => CaptureScreenshotFormat::Png,
                    crate::settings::ImageKind::Jpeg => CaptureScreenshotFormat::Jpeg,
                };
                let mut builder = ScreenshotParams::builder()
                    .format(format)
                    .full_page(options.full_page)
                    .omit_background(options.omit_background);
                if let Some(quality) = options.quality {
                    builder = builder.quality(quality as i64);
                }
                if let Some(clip) = &options.clip {
                    builder = builder.clip(ClipViewport {
                        x: clip.x as f64,
                        y: clip.y as f64,
                        width: clip.width as f64,
                        height: clip.height as f64,
                        scale: 1.0,
                    });
                }
                page.screenshot(builder.build())
                    .await
                    .map_err(|e| RenderError::RenderFailed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn render(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError> {
        tokio::select! {
            result = self.render_page(request) => result,
            _ = cancel.cancelled() => {
                debug!("Render on browser context {} cancelled", self.id);
                Err(RenderError::Cancelled)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(&self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
        debug!("Browser context {} closed", self.id);
    }
}

/// Launches Chromium processes with settings read at creation time, so a
/// context created after a settings change picks up the new viewport and
/// executable path.
pub struct ChromiumFactory {
    settings: Arc<SettingsStore>,
    next_id: AtomicUsize,
}

impl ChromiumFactory {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            next_id: AtomicUsize::new(0),
        }
    }

    fn browser_config(&self, id: usize) -> Result<BrowserConfig, RenderError> {
        let settings = self.settings.get();
        let viewport = &settings.browser.viewport;

        let mut builder = BrowserConfig::builder()
            .window_size(viewport.width, viewport.height)
            .args(chrome_args(viewport, id));

        if let Some(chrome_path) = &settings.browser.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(RenderError::BrowserLaunchFailed)
    }
}

#[async_trait]
impl ContextFactory for ChromiumFactory {
    async fn create(&self) -> Result<Arc<dyn RenderContext>, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let config = self.browser_config(id)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::BrowserLaunchFailed(e.to_string()))?;

        // The handler stream drives CDP communication and must be polled for
        // the lifetime of the browser.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                    break;
                }
            }
            debug!("Browser handler stream ended");
        });

        info!("Browser context {} launched", id);
        Ok(Arc::new(ChromiumContext {
            id,
            browser: Mutex::new(browser),
            handler: handler_task,
        }))
    }
}

fn chrome_args(viewport: &ViewportSettings, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
        format!("--user-data-dir=/tmp/render-service-{unique_id}"),
    ]
}
