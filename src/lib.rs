//! # Render Service
//!
//! Queued HTML-to-PDF and screenshot rendering on a pool of headless
//! Chromium contexts. Jobs are admitted under caller-chosen keys with
//! fail-fast backpressure, scheduled by priority with FIFO tie-breaking,
//! retried on transient failures and persisted as timestamped artifacts
//! that a periodic sweep expires.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_service::{PdfRequestOptions, RenderService, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = RenderService::new(Settings::default())?;
//!     service.start();
//!
//!     let job = service
//!         .pdf()
//!         .generate_from_url("invoice-42", "https://example.com", PdfRequestOptions::default())
//!         .await?;
//!     println!("admitted job {}", job.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-service pdf invoice-42 --url https://example.com
//! render-service screenshot hero --input page.html --kind jpeg --quality 80
//! render-service status pdf invoice-42
//! ```

/// Live settings store with validated atomic updates
pub mod settings;

/// Error taxonomy shared across the crate
pub mod error;

/// Artifact filename encoding and decoding
pub mod filename;

/// Bounded pool of rendering contexts
pub mod pool;

/// Chromium-backed rendering behind the pool traits
pub mod renderer;

/// Job model, admission control and the scheduler
pub mod queue;

/// Request validation, option merging and artifact writing
pub mod generator;

/// Periodic artifact cleanup
pub mod cleanup;

/// Service assembly and lifecycle
pub mod service;

/// Metrics registration and collection
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod tests;

pub use cli::{load_settings, setup_logging, Cli, CliRunner, Commands};
pub use error::RenderError;
pub use filename::{decode_filename, encode_filename, MediaKind, ParsedFilename};
pub use generator::{
    JobOverrides, PdfGenerator, PdfRequestOptions, RenderExecutor, ScreenshotGenerator,
    ScreenshotRequestOptions,
};
pub use queue::{Job, JobSource, JobStatus, NewJob, QueueStats, RenderQueue};
pub use service::{RenderService, ServiceStats};
pub use settings::{ImageKind, PageFormat, Settings, SettingsStore, SettingsUpdate};
