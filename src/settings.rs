//! Process-wide settings with atomic snapshot updates
//!
//! Settings are published as immutable `Arc<Settings>` snapshots through a
//! watch channel. Consumers keep a handle to the store and re-read on each
//! scheduling decision, so pool sizes, timeouts and queue limits take effect
//! without a restart.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Complete settings snapshot, grouped the way the update surface is grouped.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub browser: BrowserSettings,
    pub pdf: PdfSettings,
    pub screenshot: ScreenshotSettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BrowserSettings {
    /// Concurrent rendering contexts per pool (1-10).
    pub max_concurrent: usize,
    /// Default navigation/render timeout in milliseconds (1000-120000).
    pub default_timeout_ms: u64,
    /// How long an acquire may wait for a free slot (1000-300000).
    pub acquire_timeout_ms: u64,
    pub viewport: ViewportSettings,
    /// Chrome/Chromium executable; auto-detected when unset.
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ViewportSettings {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum PageFormat {
    A3,
    A4,
    A5,
    Letter,
    Legal,
}

impl PageFormat {
    /// Paper size in inches, the unit the print-to-PDF protocol expects.
    pub fn paper_size(&self) -> (f64, f64) {
        match self {
            PageFormat::A3 => (11.7, 16.54),
            PageFormat::A4 => (8.27, 11.7),
            PageFormat::A5 => (5.83, 8.27),
            PageFormat::Letter => (8.5, 11.0),
            PageFormat::Legal => (8.5, 14.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MarginSettings {
    pub top_mm: f64,
    pub bottom_mm: f64,
    pub left_mm: f64,
    pub right_mm: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PdfSettings {
    pub default_format: PageFormat,
    pub landscape: bool,
    pub print_background: bool,
    pub margin: MarginSettings,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScreenshotSettings {
    pub default_kind: ImageKind,
    /// JPEG quality 0-100; ignored for PNG.
    pub default_quality: Option<u8>,
    pub full_page: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct QueueSettings {
    /// Upper bound on queued + processing jobs (1-1000).
    pub max_size: usize,
    /// Hard per-job deadline in milliseconds (1000-600000).
    pub processing_timeout_ms: u64,
    /// Retries after the first attempt (0-5).
    pub retry_attempts: u32,
    /// Fixed delay before a failed job re-enters the queue (0-60000).
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    pub pdf_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    /// Artifacts older than this are removed by the cleanup sweep (1-720).
    pub cleanup_after_hours: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            browser: BrowserSettings {
                max_concurrent: 3,
                default_timeout_ms: 30_000,
                acquire_timeout_ms: 30_000,
                viewport: ViewportSettings {
                    width: 1920,
                    height: 1080,
                },
                chrome_path: None,
            },
            pdf: PdfSettings {
                default_format: PageFormat::A4,
                landscape: false,
                print_background: true,
                margin: MarginSettings {
                    top_mm: 10.0,
                    bottom_mm: 10.0,
                    left_mm: 10.0,
                    right_mm: 10.0,
                },
            },
            screenshot: ScreenshotSettings {
                default_kind: ImageKind::Png,
                default_quality: None,
                full_page: true,
            },
            queue: QueueSettings {
                max_size: 100,
                processing_timeout_ms: 60_000,
                retry_attempts: 2,
                retry_delay_ms: 1_000,
            },
            storage: StorageSettings {
                pdf_dir: PathBuf::from("pdf-files"),
                screenshot_dir: PathBuf::from("screenshot-files"),
                cleanup_after_hours: 24,
            },
        }
    }
}

impl Settings {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.processing_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.browser.acquire_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.queue.retry_delay_ms)
    }
}

/// Partial update; omitted fields keep their prior value.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SettingsUpdate {
    pub browser: Option<BrowserSettingsUpdate>,
    pub pdf: Option<PdfSettingsUpdate>,
    pub screenshot: Option<ScreenshotSettingsUpdate>,
    pub queue: Option<QueueSettingsUpdate>,
    pub storage: Option<StorageSettingsUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrowserSettingsUpdate {
    pub max_concurrent: Option<usize>,
    pub default_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub viewport: Option<ViewportSettings>,
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PdfSettingsUpdate {
    pub default_format: Option<PageFormat>,
    pub landscape: Option<bool>,
    pub print_background: Option<bool>,
    pub margin: Option<MarginSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScreenshotSettingsUpdate {
    pub default_kind: Option<ImageKind>,
    pub default_quality: Option<u8>,
    pub full_page: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueSettingsUpdate {
    pub max_size: Option<usize>,
    pub processing_timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageSettingsUpdate {
    pub pdf_dir: Option<PathBuf>,
    pub screenshot_dir: Option<PathBuf>,
    pub cleanup_after_hours: Option<u32>,
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    violations: &mut Vec<String>,
    field: &str,
    value: T,
    min: T,
    max: T,
) {
    if value < min || value > max {
        violations.push(format!("{field} must be between {min} and {max}, got {value}"));
    }
}

/// Validates a merged snapshot, collecting every violation rather than
/// stopping at the first.
fn validate(settings: &Settings) -> Vec<String> {
    let mut violations = Vec::new();

    check_range(
        &mut violations,
        "browser.max_concurrent",
        settings.browser.max_concurrent,
        1,
        10,
    );
    check_range(
        &mut violations,
        "browser.default_timeout_ms",
        settings.browser.default_timeout_ms,
        1_000,
        120_000,
    );
    check_range(
        &mut violations,
        "browser.acquire_timeout_ms",
        settings.browser.acquire_timeout_ms,
        1_000,
        300_000,
    );
    if settings.browser.viewport.width == 0 || settings.browser.viewport.height == 0 {
        violations.push("browser.viewport dimensions must be greater than 0".to_string());
    }

    for (field, value) in [
        ("pdf.margin.top_mm", settings.pdf.margin.top_mm),
        ("pdf.margin.bottom_mm", settings.pdf.margin.bottom_mm),
        ("pdf.margin.left_mm", settings.pdf.margin.left_mm),
        ("pdf.margin.right_mm", settings.pdf.margin.right_mm),
    ] {
        check_range(&mut violations, field, value, 0.0, 100.0);
    }

    if let Some(quality) = settings.screenshot.default_quality {
        check_range(
            &mut violations,
            "screenshot.default_quality",
            quality,
            0,
            100,
        );
        if settings.screenshot.default_kind != ImageKind::Jpeg {
            violations.push("screenshot.default_quality is only valid for jpeg".to_string());
        }
    }

    check_range(
        &mut violations,
        "queue.max_size",
        settings.queue.max_size,
        1,
        1_000,
    );
    check_range(
        &mut violations,
        "queue.processing_timeout_ms",
        settings.queue.processing_timeout_ms,
        1_000,
        600_000,
    );
    check_range(
        &mut violations,
        "queue.retry_attempts",
        settings.queue.retry_attempts,
        0,
        5,
    );
    check_range(
        &mut violations,
        "queue.retry_delay_ms",
        settings.queue.retry_delay_ms,
        0,
        60_000,
    );

    if settings.storage.pdf_dir.as_os_str().is_empty() {
        violations.push("storage.pdf_dir must not be empty".to_string());
    }
    if settings.storage.screenshot_dir.as_os_str().is_empty() {
        violations.push("storage.screenshot_dir must not be empty".to_string());
    }
    check_range(
        &mut violations,
        "storage.cleanup_after_hours",
        settings.storage.cleanup_after_hours,
        1,
        720,
    );

    violations
}

fn merge(current: &Settings, update: &SettingsUpdate) -> Settings {
    let mut next = current.clone();

    if let Some(browser) = &update.browser {
        if let Some(v) = browser.max_concurrent {
            next.browser.max_concurrent = v;
        }
        if let Some(v) = browser.default_timeout_ms {
            next.browser.default_timeout_ms = v;
        }
        if let Some(v) = browser.acquire_timeout_ms {
            next.browser.acquire_timeout_ms = v;
        }
        if let Some(v) = &browser.viewport {
            next.browser.viewport = v.clone();
        }
        if let Some(v) = &browser.chrome_path {
            next.browser.chrome_path = Some(v.clone());
        }
    }

    if let Some(pdf) = &update.pdf {
        if let Some(v) = pdf.default_format {
            next.pdf.default_format = v;
        }
        if let Some(v) = pdf.landscape {
            next.pdf.landscape = v;
        }
        if let Some(v) = pdf.print_background {
            next.pdf.print_background = v;
        }
        if let Some(v) = &pdf.margin {
            next.pdf.margin = v.clone();
        }
    }

    if let Some(screenshot) = &update.screenshot {
        if let Some(v) = screenshot.default_kind {
            next.screenshot.default_kind = v;
        }
        if let Some(v) = screenshot.default_quality {
            next.screenshot.default_quality = Some(v);
        }
        if let Some(v) = screenshot.full_page {
            next.screenshot.full_page = v;
        }
    }

    if let Some(queue) = &update.queue {
        if let Some(v) = queue.max_size {
            next.queue.max_size = v;
        }
        if let Some(v) = queue.processing_timeout_ms {
            next.queue.processing_timeout_ms = v;
        }
        if let Some(v) = queue.retry_attempts {
            next.queue.retry_attempts = v;
        }
        if let Some(v) = queue.retry_delay_ms {
            next.queue.retry_delay_ms = v;
        }
    }

    if let Some(storage) = &update.storage {
        if let Some(v) = &storage.pdf_dir {
            next.storage.pdf_dir = v.clone();
        }
        if let Some(v) = &storage.screenshot_dir {
            next.storage.screenshot_dir = v.clone();
        }
        if let Some(v) = storage.cleanup_after_hours {
            next.storage.cleanup_after_hours = v;
        }
    }

    next
}

/// Store publishing immutable settings snapshots.
pub struct SettingsStore {
    defaults: Settings,
    tx: watch::Sender<Arc<Settings>>,
}

impl SettingsStore {
    pub fn new(defaults: Settings) -> Result<Self, RenderError> {
        let violations = validate(&defaults);
        if !violations.is_empty() {
            return Err(RenderError::Validation(violations.join("; ")));
        }
        let (tx, _rx) = watch::channel(Arc::new(defaults.clone()));
        Ok(Self { defaults, tx })
    }

    /// Current snapshot; immutable, safe to hold across awaits.
    pub fn get(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// Change notification for consumers that suspend waiting on capacity.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Applies a partial update. All-or-nothing: if any field of the merged
    /// snapshot is out of range the prior snapshot stays published and every
    /// violation is reported.
    pub fn update(&self, update: SettingsUpdate) -> Result<Arc<Settings>, RenderError> {
        let merged = merge(&self.get(), &update);
        let violations = validate(&merged);
        if !violations.is_empty() {
            return Err(RenderError::Validation(violations.join("; ")));
        }

        let snapshot = Arc::new(merged);
        self.tx.send_replace(snapshot.clone());
        info!("Settings updated");
        Ok(snapshot)
    }

    pub fn reset(&self) -> Arc<Settings> {
        let snapshot = Arc::new(self.defaults.clone());
        self.tx.send_replace(snapshot.clone());
        info!("Settings reset to defaults");
        snapshot
    }
}
