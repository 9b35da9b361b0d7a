//! Service assembly
//!
//! Owns the settings store, the shared browser pool, one queue per media
//! surface and the background tasks (schedulers, cleanup sweep, metrics
//! collection). Everything shuts down through a single cancellation token.

use crate::cleanup::CleanupSweeper;
use crate::generator::{PdfGenerator, RenderExecutor, ScreenshotGenerator};
use crate::metrics::{Metrics, MetricsCollector};
use crate::pool::{PoolStats, WorkerPool};
use crate::queue::{QueueStats, RenderQueue};
use crate::renderer::{ChromiumFactory, ContextFactory};
use crate::settings::{Settings, SettingsStore};
use crate::RenderError;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pdf: QueueStats,
    pub screenshot: QueueStats,
    pub pdf_pool: PoolStats,
    pub screenshot_pool: PoolStats,
}

pub struct RenderService {
    settings: Arc<SettingsStore>,
    pdf_pool: WorkerPool,
    screenshot_pool: WorkerPool,
    pdf_queue: RenderQueue,
    screenshot_queue: RenderQueue,
    pdf: PdfGenerator,
    screenshot: ScreenshotGenerator,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RenderService {
    /// Production assembly with a Chromium-backed pool.
    pub fn new(settings: Settings) -> Result<Self, RenderError> {
        let store = Arc::new(SettingsStore::new(settings)?);
        let factory = Arc::new(ChromiumFactory::new(store.clone()));
        Ok(Self::assemble(store, factory))
    }

    /// Assembly with an injected rendering backend.
    pub fn with_factory(
        settings: Settings,
        factory: Arc<dyn ContextFactory>,
    ) -> Result<Self, RenderError> {
        let store = Arc::new(SettingsStore::new(settings)?);
        Ok(Self::assemble(store, factory))
    }

    fn assemble(store: Arc<SettingsStore>, factory: Arc<dyn ContextFactory>) -> Self {
        let executor = Arc::new(RenderExecutor::new(store.clone()));

        // One pool per queue: a slot freed on one surface wakes that
        // surface's scheduler and never depends on the other queue's traffic.
        let pdf_pool = WorkerPool::new(store.clone(), factory.clone());
        let screenshot_pool = WorkerPool::new(store.clone(), factory);

        let pdf_queue =
            RenderQueue::new("pdf", store.clone(), pdf_pool.clone(), executor.clone());
        let screenshot_queue =
            RenderQueue::new("screenshot", store.clone(), screenshot_pool.clone(), executor);

        Self {
            pdf: PdfGenerator::new(store.clone(), pdf_queue.clone()),
            screenshot: ScreenshotGenerator::new(store.clone(), screenshot_queue.clone()),
            settings: store,
            pdf_pool,
            screenshot_pool,
            pdf_queue,
            screenshot_queue,
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Spawns schedulers, the cleanup sweep and metrics collection.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(self.pdf_queue.start());
        tasks.push(self.screenshot_queue.start());

        let sweeper = Arc::new(CleanupSweeper::new(
            self.settings.clone(),
            self.pdf_queue.clone(),
            self.screenshot_queue.clone(),
        ));
        tasks.push(sweeper.start(self.shutdown.clone()));

        let collector = MetricsCollector::new(
            Metrics::register(),
            self.pdf_queue.clone(),
            self.screenshot_queue.clone(),
            self.pdf_pool.clone(),
            self.screenshot_pool.clone(),
        );
        tasks.push(collector.start(self.shutdown.clone()));

        info!("Render service started");
    }

    pub fn pdf(&self) -> &PdfGenerator {
        &self.pdf
    }

    pub fn screenshot(&self) -> &ScreenshotGenerator {
        &self.screenshot
    }

    pub fn pdf_queue(&self) -> &RenderQueue {
        &self.pdf_queue
    }

    pub fn screenshot_queue(&self) -> &RenderQueue {
        &self.screenshot_queue
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            pdf: self.pdf_queue.stats().await,
            screenshot: self.screenshot_queue.stats().await,
            pdf_pool: self.pdf_pool.stats().await,
            screenshot_pool: self.screenshot_pool.stats().await,
        }
    }

    /// Stops dispatch, drains in-flight work into its own tasks and closes
    /// idle browser contexts.
    pub async fn shutdown(&self) {
        info!("Render service shutting down");
        self.shutdown.cancel();
        self.pdf_queue.shutdown();
        self.screenshot_queue.shutdown();

        let tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }

        self.pdf_pool.shutdown().await;
        self.screenshot_pool.shutdown().await;
        info!("Render service stopped");
    }
}
