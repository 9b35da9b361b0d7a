//! Periodic artifact cleanup
//!
//! Sweeps both storage directories, deleting artifacts whose embedded
//! timestamp is at least `storage.cleanup_after_hours` old. Files that do not
//! decode as artifact names are never touched. Terminal job records whose
//! artifact was removed are evicted from the owning queue so status lookups
//! stop pointing at a deleted file.

use crate::filename::{decode_filename, MediaKind};
use crate::queue::RenderQueue;
use crate::settings::SettingsStore;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries considered across both directories.
    pub scanned: usize,
    pub deleted: usize,
    pub retained: usize,
    /// Files that do not decode as artifact names.
    pub ignored: usize,
}

pub struct CleanupSweeper {
    settings: Arc<SettingsStore>,
    pdf_queue: RenderQueue,
    screenshot_queue: RenderQueue,
}

impl CleanupSweeper {
    pub fn new(
        settings: Arc<SettingsStore>,
        pdf_queue: RenderQueue,
        screenshot_queue: RenderQueue,
    ) -> Self {
        Self {
            settings,
            pdf_queue,
            screenshot_queue,
        }
    }

    /// Sweeps once immediately, then hourly until shutdown.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Cleanup sweeper started");
            loop {
                let report = self.sweep().await;
                if report.deleted > 0 {
                    info!(
                        deleted = report.deleted,
                        retained = report.retained,
                        "Cleanup sweep removed expired artifacts"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Cleanup sweeper stopped");
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        let settings = self.settings.get();
        let mut report = SweepReport::default();
        self.sweep_dir(&settings.storage.pdf_dir, &mut report).await;
        self.sweep_dir(&settings.storage.screenshot_dir, &mut report)
            .await;
        report
    }

    async fn sweep_dir(&self, dir: &Path, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            // Nothing rendered into this directory yet.
            Err(_) => return,
        };

        let now = Utc::now();
        let max_age = self.settings.get().storage.cleanup_after_hours as u64;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                report.ignored += 1;
                continue;
            };
            report.scanned += 1;

            let Some(parsed) = decode_filename(name) else {
                report.ignored += 1;
                continue;
            };

            if parsed.age_hours(now) < max_age {
                report.retained += 1;
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(file = name, "Expired artifact removed");
                    report.deleted += 1;
                    let queue = match parsed.media {
                        MediaKind::Pdf => &self.pdf_queue,
                        MediaKind::Png | MediaKind::Jpeg => &self.screenshot_queue,
                    };
                    queue.evict(&parsed.requested_key).await;
                }
                Err(e) => {
                    warn!(file = name, error = %e, "Failed to remove expired artifact");
                    report.retained += 1;
                }
            }
        }
    }
}
