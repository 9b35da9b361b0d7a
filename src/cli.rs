use crate::generator::{JobOverrides, PdfRequestOptions, ScreenshotRequestOptions};
use crate::queue::{ClipRegion, Job, JobStatus, RenderQueue};
use crate::service::RenderService;
use crate::settings::{ImageKind, PageFormat, Settings, SettingsUpdate};
use crate::RenderError;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::info;

#[derive(Parser)]
#[command(name = "render-service")]
#[command(about = "Queued HTML to PDF and screenshot rendering")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Settings file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Concurrent browser contexts")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Expose Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MediaArg {
    Pdf,
    Screenshot,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    A3,
    A4,
    A5,
    Letter,
    Legal,
}

impl From<FormatArg> for PageFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::A3 => PageFormat::A3,
            FormatArg::A4 => PageFormat::A4,
            FormatArg::A5 => PageFormat::A5,
            FormatArg::Letter => PageFormat::Letter,
            FormatArg::Legal => PageFormat::Legal,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Png,
    Jpeg,
}

impl From<KindArg> for ImageKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Png => ImageKind::Png,
            KindArg::Jpeg => ImageKind::Jpeg,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a PDF from a URL or an HTML file
    Pdf {
        #[arg(help = "Job key; also the artifact filename prefix")]
        key: String,

        #[arg(long, help = "Page URL to render")]
        url: Option<String>,

        #[arg(long, help = "HTML file to render")]
        input: Option<PathBuf>,

        #[arg(long, help = "Paper format")]
        format: Option<FormatArg>,

        #[arg(long, help = "Landscape orientation")]
        landscape: bool,

        #[arg(long, help = "Job priority (higher runs first)")]
        priority: Option<i32>,

        #[arg(long, help = "Replace an active job with the same key")]
        re_create: bool,

        #[arg(long, help = "Return immediately instead of waiting for the result")]
        no_wait: bool,
    },

    /// Render a screenshot from a URL or an HTML file
    Screenshot {
        #[arg(help = "Job key; also the artifact filename prefix")]
        key: String,

        #[arg(long, help = "Page URL to render")]
        url: Option<String>,

        #[arg(long, help = "HTML file to render")]
        input: Option<PathBuf>,

        #[arg(long, help = "Image kind")]
        kind: Option<KindArg>,

        #[arg(long, help = "JPEG quality (0-100)")]
        quality: Option<u8>,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,

        #[arg(long, value_names = ["X", "Y", "W", "H"], num_args = 4, help = "Clip region")]
        clip: Option<Vec<u32>>,

        #[arg(long, help = "Job priority (higher runs first)")]
        priority: Option<i32>,

        #[arg(long, help = "Replace an active job with the same key")]
        re_create: bool,

        #[arg(long, help = "Return immediately instead of waiting for the result")]
        no_wait: bool,
    },

    /// Show the status of a job
    Status {
        #[arg(value_enum)]
        media: MediaArg,
        key: String,
    },

    /// Cancel a queued or processing job
    Cancel {
        #[arg(value_enum)]
        media: MediaArg,
        key: String,
    },

    /// Show queue and pool statistics
    Stats,

    /// Show or change the live settings
    Settings {
        #[arg(long, help = "Apply a partial settings update from a JSON file")]
        update: Option<PathBuf>,

        #[arg(long, help = "Reset settings to startup defaults")]
        reset: bool,
    },
}

pub struct CliRunner {
    pub service: Arc<RenderService>,
}

impl CliRunner {
    pub fn new(settings: Settings) -> Result<Self, RenderError> {
        let service = Arc::new(RenderService::new(settings)?);
        service.start();
        Ok(Self { service })
    }

    pub async fn run(&self, command: Commands) -> Result<(), RenderError> {
        match command {
            Commands::Pdf {
                key,
                url,
                input,
                format,
                landscape,
                priority,
                re_create,
                no_wait,
            } => {
                let options = PdfRequestOptions {
                    format: format.map(Into::into),
                    landscape: landscape.then_some(true),
                    job: JobOverrides {
                        priority,
                        re_create: re_create.then_some(true),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let job = match (url, input) {
                    (Some(url), None) => {
                        self.service.pdf().generate_from_url(&key, &url, options).await?
                    }
                    (None, Some(path)) => {
                        let html = fs::read_to_string(&path).await?;
                        self.service
                            .pdf()
                            .generate_from_file(&key, html, options)
                            .await?
                    }
                    _ => {
                        return Err(RenderError::Validation(
                            "exactly one of --url or --input is required".to_string(),
                        ))
                    }
                };
                self.report(job, self.service.pdf_queue(), no_wait).await
            }
            Commands::Screenshot {
                key,
                url,
                input,
                kind,
                quality,
                full_page,
                clip,
                priority,
                re_create,
                no_wait,
            } => {
                let clip = clip.map(|v| ClipRegion {
                    x: v[0],
                    y: v[1],
                    width: v[2],
                    height: v[3],
                });
                let options = ScreenshotRequestOptions {
                    kind: kind.map(Into::into),
                    quality,
                    full_page: full_page.then_some(true),
                    clip,
                    job: JobOverrides {
                        priority,
                        re_create: re_create.then_some(true),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let job = match (url, input) {
                    (Some(url), None) => {
                        self.service
                            .screenshot()
                            .generate_from_url(&key, &url, options)
                            .await?
                    }
                    (None, Some(path)) => {
                        let html = fs::read_to_string(&path).await?;
                        self.service
                            .screenshot()
                            .generate_from_file(&key, html, options)
                            .await?
                    }
                    _ => {
                        return Err(RenderError::Validation(
                            "exactly one of --url or --input is required".to_string(),
                        ))
                    }
                };
                self.report(job, self.service.screenshot_queue(), no_wait)
                    .await
            }
            Commands::Status { media, key } => {
                let job = self.queue_for(media).job_status(&key).await?;
                println!("{}", serde_json::to_string_pretty(&job)?);
                Ok(())
            }
            Commands::Cancel { media, key } => {
                let job = self.queue_for(media).cancel(&key).await?;
                println!("Cancelled job '{}' ({:?})", job.requested_key, job.id);
                Ok(())
            }
            Commands::Stats => {
                let stats = self.service.stats().await;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }
            Commands::Settings { update, reset } => self.run_settings(update, reset).await,
        }
    }

    fn queue_for(&self, media: MediaArg) -> &RenderQueue {
        match media {
            MediaArg::Pdf => self.service.pdf_queue(),
            MediaArg::Screenshot => self.service.screenshot_queue(),
        }
    }

    async fn run_settings(
        &self,
        update: Option<PathBuf>,
        reset: bool,
    ) -> Result<(), RenderError> {
        let snapshot = if reset {
            self.service.settings().reset()
        } else if let Some(path) = update {
            let content = fs::read_to_string(&path).await?;
            let update: SettingsUpdate = serde_json::from_str(&content)?;
            self.service.settings().update(update)?
        } else {
            self.service.settings().get()
        };
        println!("{}", serde_json::to_string_pretty(&*snapshot)?);
        Ok(())
    }

    async fn report(
        &self,
        job: Job,
        queue: &RenderQueue,
        no_wait: bool,
    ) -> Result<(), RenderError> {
        println!("Job '{}' admitted ({:?})", job.requested_key, job.id);
        if no_wait {
            return Ok(());
        }

        let done = wait_for_terminal(queue, &job.requested_key).await?;
        match done.status {
            JobStatus::Completed => {
                let path = done
                    .file_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!("Completed after {} attempt(s): {}", done.attempts, path);
                Ok(())
            }
            JobStatus::Cancelled => {
                println!("Job '{}' was cancelled", done.requested_key);
                Ok(())
            }
            _ => Err(RenderError::RenderFailed(
                done.error.unwrap_or_else(|| "job failed".to_string()),
            )),
        }
    }
}

async fn wait_for_terminal(queue: &RenderQueue, key: &str) -> Result<Job, RenderError> {
    loop {
        let job = queue.job_status(key).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        info!(
            key = key,
            status = ?job.status,
            progress = job.progress,
            "Waiting for job"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Loads settings from the optional JSON file and applies CLI overrides.
pub async fn load_settings(args: &Cli) -> Result<Settings, RenderError> {
    let mut settings = if let Some(path) = &args.config {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content)?
    } else {
        Settings::default()
    };

    if let Some(max_concurrent) = args.max_concurrent {
        settings.browser.max_concurrent = max_concurrent;
    }
    if let Some(chrome_path) = &args.chrome_path {
        settings.browser.chrome_path = Some(chrome_path.clone());
    }

    Ok(settings)
}

pub fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
