//! Metrics registration and periodic collection
//!
//! Handles are registered once at startup and held in `Metrics`; the
//! collector samples queue and pool state on an interval and publishes
//! counter deltas computed from the queues' cumulative totals.

use crate::pool::{PoolStats, WorkerPool};
use crate::queue::{QueueTotals, RenderQueue};
use metrics::{register_counter, register_gauge, Counter, Gauge};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

pub struct QueueMetrics {
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_cancelled: Counter,
    pub jobs_retried: Counter,
    pub queued: Gauge,
    pub processing: Gauge,
}

impl QueueMetrics {
    fn register(queue: &'static str) -> Self {
        Self {
            jobs_submitted: register_counter!("render_jobs_submitted_total", "queue" => queue),
            jobs_completed: register_counter!("render_jobs_completed_total", "queue" => queue),
            jobs_failed: register_counter!("render_jobs_failed_total", "queue" => queue),
            jobs_cancelled: register_counter!("render_jobs_cancelled_total", "queue" => queue),
            jobs_retried: register_counter!("render_jobs_retried_total", "queue" => queue),
            queued: register_gauge!("render_jobs_queued", "queue" => queue),
            processing: register_gauge!("render_jobs_processing", "queue" => queue),
        }
    }
}

pub struct PoolMetrics {
    pub limit: Gauge,
    pub in_use: Gauge,
    pub idle: Gauge,
    pub contexts_created: Gauge,
    pub contexts_discarded: Gauge,
}

impl PoolMetrics {
    fn register(queue: &'static str) -> Self {
        Self {
            limit: register_gauge!("render_pool_limit", "queue" => queue),
            in_use: register_gauge!("render_pool_in_use", "queue" => queue),
            idle: register_gauge!("render_pool_idle", "queue" => queue),
            contexts_created: register_gauge!("render_contexts_created", "queue" => queue),
            contexts_discarded: register_gauge!("render_contexts_discarded", "queue" => queue),
        }
    }
}

pub struct Metrics {
    pub pdf: QueueMetrics,
    pub screenshot: QueueMetrics,
    pub pdf_pool: PoolMetrics,
    pub screenshot_pool: PoolMetrics,
}

impl Metrics {
    pub fn register() -> Self {
        Self {
            pdf: QueueMetrics::register("pdf"),
            screenshot: QueueMetrics::register("screenshot"),
            pdf_pool: PoolMetrics::register("pdf"),
            screenshot_pool: PoolMetrics::register("screenshot"),
        }
    }
}

/// Samples both queues and their pools on a fixed interval.
pub struct MetricsCollector {
    metrics: Metrics,
    pdf_queue: RenderQueue,
    screenshot_queue: RenderQueue,
    pdf_pool: WorkerPool,
    screenshot_pool: WorkerPool,
}

impl MetricsCollector {
    pub fn new(
        metrics: Metrics,
        pdf_queue: RenderQueue,
        screenshot_queue: RenderQueue,
        pdf_pool: WorkerPool,
        screenshot_pool: WorkerPool,
    ) -> Self {
        Self {
            metrics,
            pdf_queue,
            screenshot_queue,
            pdf_pool,
            screenshot_pool,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Metrics collection started");
            let mut pdf_seen = QueueTotals::default();
            let mut screenshot_seen = QueueTotals::default();
            let mut interval = tokio::time::interval(COLLECTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let stats = self.pdf_queue.stats().await;
                publish_queue(&self.metrics.pdf, stats.queued, stats.processing);
                publish_totals(&self.metrics.pdf, &mut pdf_seen, stats.totals);

                let stats = self.screenshot_queue.stats().await;
                publish_queue(&self.metrics.screenshot, stats.queued, stats.processing);
                publish_totals(&self.metrics.screenshot, &mut screenshot_seen, stats.totals);

                publish_pool(&self.metrics.pdf_pool, self.pdf_pool.stats().await);
                publish_pool(
                    &self.metrics.screenshot_pool,
                    self.screenshot_pool.stats().await,
                );
            }
            info!("Metrics collection stopped");
        })
    }
}

fn publish_pool(metrics: &PoolMetrics, stats: PoolStats) {
    metrics.limit.set(stats.limit as f64);
    metrics.in_use.set(stats.in_use as f64);
    metrics.idle.set(stats.idle as f64);
    metrics.contexts_created.set(stats.contexts_created as f64);
    metrics.contexts_discarded.set(stats.contexts_discarded as f64);
}

fn publish_queue(metrics: &QueueMetrics, queued: usize, processing: usize) {
    metrics.queued.set(queued as f64);
    metrics.processing.set(processing as f64);
}

fn publish_totals(metrics: &QueueMetrics, seen: &mut QueueTotals, current: QueueTotals) {
    metrics
        .jobs_submitted
        .increment(current.submitted - seen.submitted);
    metrics
        .jobs_completed
        .increment(current.completed - seen.completed);
    metrics.jobs_failed.increment(current.failed - seen.failed);
    metrics
        .jobs_cancelled
        .increment(current.cancelled - seen.cancelled);
    metrics.jobs_retried.increment(current.retries - seen.retries);
    *seen = current;
}
