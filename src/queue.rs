//! Job queue and scheduler
//!
//! One generic engine instantiated per media kind (pdf, screenshot). All job
//! and queue mutation funnels through a single mutex so status transitions
//! are totally ordered: a job never ends in two terminal states, and a
//! cancellation racing a completion is resolved by whichever writer gets the
//! lock first.

use crate::filename::MediaKind;
use crate::pool::WorkerPool;
use crate::renderer::RenderContext;
use crate::settings::{ImageKind, MarginSettings, PageFormat, SettingsStore, ViewportSettings};
use crate::RenderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default priority for submissions that do not specify one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Terminal jobs kept for status queries, as a multiple of `queue.max_size`.
const TERMINAL_RETENTION_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active jobs count against queue capacity and hold their key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

#[derive(Debug, Clone)]
pub enum JobSource {
    /// Raw HTML submitted inline.
    Html(String),
    /// Page fetched by the browser.
    Url(String),
    /// HTML content uploaded as a file.
    File(String),
}

impl JobSource {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSource::Html(_) => "html",
            JobSource::Url(_) => "url",
            JobSource::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClipRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PdfOptions {
    pub format: PageFormat,
    pub landscape: bool,
    pub print_background: bool,
    pub margin: MarginSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotOptions {
    pub kind: ImageKind,
    pub quality: Option<u8>,
    pub full_page: bool,
    pub clip: Option<ClipRegion>,
    pub omit_background: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaOptions {
    Pdf(PdfOptions),
    Screenshot(ScreenshotOptions),
}

impl MediaOptions {
    pub fn media_kind(&self) -> MediaKind {
        match self {
            MediaOptions::Pdf(_) => MediaKind::Pdf,
            MediaOptions::Screenshot(options) => match options.kind {
                ImageKind::Png => MediaKind::Png,
                ImageKind::Jpeg => MediaKind::Jpeg,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowserJobOptions {
    pub timeout_ms: u64,
    pub viewport: ViewportSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueJobOptions {
    pub priority: i32,
    pub processing_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// Effective options, merged over the settings snapshot at admission and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct JobOptions {
    pub browser: BrowserJobOptions,
    pub media: MediaOptions,
    pub queue: QueueJobOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: uuid::Uuid,
    pub requested_key: String,
    #[serde(skip)]
    pub source: JobSource,
    pub media: MediaKind,
    pub status: JobStatus,
    pub progress: u8,
    pub priority: i32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub options: JobOptions,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub requested_key: String,
    pub source: JobSource,
    pub options: JobOptions,
    pub re_create: bool,
}

/// Cumulative transition counts since the queue was created. Unlike the
/// per-status counts these never decrease when records are evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueTotals {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub totals: QueueTotals,
}

/// Dispatch-time execution: renders the job on the given context and writes
/// the artifact, returning its path. Implemented by the generators.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &Job,
        context: Arc<dyn RenderContext>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, RenderError>;
}

/// Lets an executor report progress back into the job record. Progress is
/// clamped to 0-100 and never decreases while processing.
pub struct ProgressReporter {
    queue: Weak<QueueInner>,
    key: String,
}

impl ProgressReporter {
    #[cfg(test)]
    pub(crate) fn detached(key: &str) -> Self {
        Self {
            queue: Weak::new(),
            key: key.to_string(),
        }
    }

    pub async fn set(&self, value: u8) {
        let Some(inner) = self.queue.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&self.key) {
            if job.status == JobStatus::Processing {
                job.progress = job.progress.max(value.min(100));
                job.updated_at = Utc::now();
            }
        }
    }
}

struct QueueState {
    jobs: HashMap<String, Job>,
    tokens: HashMap<String, CancellationToken>,
    next_seq: u64,
    totals: QueueTotals,
}

struct QueueInner {
    label: &'static str,
    settings: Arc<SettingsStore>,
    pool: WorkerPool,
    executor: Arc<dyn JobExecutor>,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown: CancellationToken,
}

pub struct RenderQueue {
    inner: Arc<QueueInner>,
}

impl Clone for RenderQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RenderQueue {
    pub fn new(
        label: &'static str,
        settings: Arc<SettingsStore>,
        pool: WorkerPool,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label,
                settings,
                pool,
                executor,
                state: Mutex::new(QueueState {
                    jobs: HashMap::new(),
                    tokens: HashMap::new(),
                    next_seq: 0,
                    totals: QueueTotals::default(),
                }),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the scheduler loop. Dispatch is driven by two signals: "job
    /// admitted" and "capacity became available"; there is no polling.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(run_scheduler(inner))
    }

    /// Admission control. Fails fast instead of blocking: a full queue is a
    /// backpressure signal, not an invitation to buffer.
    pub async fn submit(&self, new_job: NewJob) -> Result<Job, RenderError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RenderError::ShuttingDown);
        }
        if !crate::filename::is_valid_key(&new_job.requested_key) {
            return Err(RenderError::Validation(format!(
                "requestedKey must be 1-255 alphanumeric/dash/underscore characters, got '{}'",
                new_job.requested_key
            )));
        }

        let job = {
            let mut state = self.inner.state.lock().await;
            let replacing = matches!(
                state.jobs.get(&new_job.requested_key),
                Some(existing) if existing.status.is_active()
            );
            if replacing && !new_job.re_create {
                return Err(RenderError::DuplicateKey(new_job.requested_key));
            }

            // A reCreate swaps one active job for another and leaves the
            // active count unchanged, so it bypasses the capacity check.
            if !replacing {
                let max_size = self.inner.settings.get().queue.max_size;
                let active = state
                    .jobs
                    .values()
                    .filter(|j| j.status.is_active())
                    .count();
                if active >= max_size {
                    return Err(RenderError::QueueFull {
                        size: active,
                        max: max_size,
                    });
                }
            }

            if replacing {
                // The prior active job is cancelled before the new one takes
                // over its key.
                cancel_locked(&mut state, &new_job.requested_key)?;
            }

            let now = Utc::now();
            let seq = state.next_seq;
            state.next_seq += 1;
            let job = Job {
                id: uuid::Uuid::new_v4(),
                requested_key: new_job.requested_key.clone(),
                media: new_job.options.media.media_kind(),
                source: new_job.source,
                status: JobStatus::Queued,
                progress: 0,
                priority: new_job.options.queue.priority,
                attempts: 0,
                created_at: now,
                updated_at: now,
                options: new_job.options,
                file_path: None,
                error: None,
                seq,
            };
            state.jobs.insert(new_job.requested_key.clone(), job.clone());
            state
                .tokens
                .insert(new_job.requested_key, CancellationToken::new());
            state.totals.submitted += 1;
            job
        };

        debug!(
            queue = self.inner.label,
            key = %job.requested_key,
            priority = job.priority,
            "Job admitted"
        );
        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Cancels a queued or processing job. In-flight renders get a
    /// best-effort abort signal; the job record transitions to `Cancelled`
    /// immediately either way.
    pub async fn cancel(&self, requested_key: &str) -> Result<Job, RenderError> {
        let mut state = self.inner.state.lock().await;
        if !state.jobs.contains_key(requested_key) {
            return Err(RenderError::NotFound(requested_key.to_string()));
        }
        let job = cancel_locked(&mut state, requested_key)?;
        info!(queue = self.inner.label, key = requested_key, "Job cancelled");
        Ok(job)
    }

    pub async fn job_status(&self, requested_key: &str) -> Result<Job, RenderError> {
        let state = self.inner.state.lock().await;
        state
            .jobs
            .get(requested_key)
            .cloned()
            .ok_or_else(|| RenderError::NotFound(requested_key.to_string()))
    }

    /// Counts over the full retained job set: active plus terminal jobs not
    /// yet evicted.
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats {
            total: state.jobs.len(),
            totals: state.totals,
            ..Default::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drops a terminal job record, typically after its artifact was cleaned
    /// up. Active jobs are left alone.
    pub async fn evict(&self, requested_key: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let evictable = matches!(
            state.jobs.get(requested_key),
            Some(job) if job.status.is_terminal()
        );
        if evictable {
            state.jobs.remove(requested_key);
        }
        evictable
    }

    /// Stops the scheduler. In-flight renders drain through their own tasks.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn cancel_locked(state: &mut QueueState, requested_key: &str) -> Result<Job, RenderError> {
    let job = state
        .jobs
        .get_mut(requested_key)
        .ok_or_else(|| RenderError::NotFound(requested_key.to_string()))?;
    if job.status.is_terminal() {
        return Err(RenderError::InvalidState(format!(
            "cannot cancel a {} job",
            match job.status {
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
                _ => "cancelled",
            }
        )));
    }
    if let Some(token) = state.tokens.remove(requested_key) {
        token.cancel();
    }
    job.status = JobStatus::Cancelled;
    job.updated_at = Utc::now();
    let snapshot = job.clone();
    state.totals.cancelled += 1;
    Ok(snapshot)
}

async fn run_scheduler(inner: Arc<QueueInner>) {
    let mut settings_rx = inner.settings.subscribe();
    info!(queue = inner.label, "Scheduler started");
    loop {
        while !inner.shutdown.is_cancelled() {
            if inner.pool.free_capacity().await == 0 {
                break;
            }
            let Some(key) = next_eligible(&inner).await else {
                break;
            };
            dispatch(&inner, key).await;
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = settings_rx.changed() => {
                debug!(queue = inner.label, "Settings changed, re-evaluating dispatch");
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }
    info!(queue = inner.label, "Scheduler stopped");
}

/// Highest priority first, FIFO by admission among equals.
async fn next_eligible(inner: &Arc<QueueInner>) -> Option<String> {
    let state = inner.state.lock().await;
    state
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Queued)
        .min_by_key(|j| (std::cmp::Reverse(j.priority), j.created_at, j.seq))
        .map(|j| j.requested_key.clone())
}

async fn dispatch(inner: &Arc<QueueInner>, key: String) {
    let (job_id, token) = {
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let Some(job) = state.jobs.get_mut(&key) else {
            return;
        };
        // A cancel may have landed between selection and here.
        if job.status != JobStatus::Queued {
            return;
        }
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();
        match state.tokens.get(&key) {
            Some(token) => (job.id, token.clone()),
            None => return,
        }
    };

    match inner.pool.acquire().await {
        Ok(slot) => {
            let inner = inner.clone();
            tokio::spawn(async move {
                let context = slot.context();
                let outcome = execute(&inner, &key, job_id, context, &token).await;
                slot.release().await;
                apply_outcome(&inner, &key, job_id, outcome).await;
                inner.wake.notify_one();
            });
        }
        Err(e) => {
            // Pool starvation counts as a transient failure for this attempt.
            warn!(queue = inner.label, key = %key, error = %e, "Slot acquisition failed");
            apply_outcome(inner, &key, job_id, Err(e)).await;
            inner.wake.notify_one();
        }
    }
}

async fn execute(
    inner: &Arc<QueueInner>,
    key: &str,
    job_id: uuid::Uuid,
    context: Arc<dyn RenderContext>,
    token: &CancellationToken,
) -> Result<PathBuf, RenderError> {
    let job = {
        let state = inner.state.lock().await;
        // The record may have been replaced by a reCreate since dispatch.
        match state.jobs.get(key) {
            Some(job) if job.id == job_id => job.clone(),
            _ => return Err(RenderError::Cancelled),
        }
    };
    let deadline = Duration::from_millis(job.options.queue.processing_timeout_ms);
    let reporter = ProgressReporter {
        queue: Arc::downgrade(inner),
        key: key.to_string(),
    };

    tokio::select! {
        _ = token.cancelled() => Err(RenderError::Cancelled),
        result = timeout(deadline, inner.executor.execute(&job, context, token, &reporter)) => {
            match result {
                Ok(outcome) => outcome,
                Err(_) => Err(RenderError::ProcessingTimeout(deadline)),
            }
        }
    }
}

async fn apply_outcome(
    inner: &Arc<QueueInner>,
    key: &str,
    job_id: uuid::Uuid,
    outcome: Result<PathBuf, RenderError>,
) {
    let stale_artifact = {
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let max_size = inner.settings.get().queue.max_size;
        // A reCreate may have replaced the record since dispatch; this
        // outcome then belongs to a superseded job and any output is
        // orphaned.
        let current = matches!(state.jobs.get(key), Some(job) if job.id == job_id);
        if !current {
            drop(guard);
            if let Ok(path) = outcome {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return;
        }
        let Some(job) = state.jobs.get_mut(key) else {
            return;
        };

        match outcome {
            Ok(path) => {
                if job.status != JobStatus::Processing {
                    // Cancellation won the race; the artifact is orphaned.
                    Some(path)
                } else {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.file_path = Some(path);
                    job.updated_at = Utc::now();
                    state.tokens.remove(key);
                    state.totals.completed += 1;
                    info!(queue = inner.label, key = key, "Job completed");
                    prune_terminal(state, max_size);
                    None
                }
            }
            Err(RenderError::Cancelled) => {
                // Bookkeeping already moved to Cancelled when the cancel was
                // requested; a shutdown-triggered abort lands here too.
                if job.status == JobStatus::Processing {
                    job.status = JobStatus::Cancelled;
                    job.updated_at = Utc::now();
                    state.tokens.remove(key);
                    state.totals.cancelled += 1;
                }
                None
            }
            Err(e) => {
                if job.status != JobStatus::Processing {
                    None
                } else if e.is_retryable() && job.attempts < job.options.queue.retry_attempts + 1 {
                    let delay = Duration::from_millis(job.options.queue.retry_delay_ms);
                    warn!(
                        queue = inner.label,
                        key = key,
                        attempt = job.attempts,
                        error = %e,
                        "Job failed, retrying after {:?}",
                        delay
                    );
                    state.totals.retries += 1;
                    schedule_requeue(inner.clone(), key.to_string(), job_id, delay);
                    None
                } else {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                    job.updated_at = Utc::now();
                    state.tokens.remove(key);
                    state.totals.failed += 1;
                    warn!(
                        queue = inner.label,
                        key = key,
                        attempts = job.attempts,
                        error = %e,
                        "Job failed permanently"
                    );
                    prune_terminal(state, max_size);
                    None
                }
            }
        }
    };

    if let Some(path) = stale_artifact {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

/// The job stays `Processing` during the fixed retry delay; the slot was
/// already released so other jobs keep flowing. A cancel during the delay
/// wins because the requeue only fires on a still-processing job.
fn schedule_requeue(inner: Arc<QueueInner>, key: String, job_id: uuid::Uuid, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut state = inner.state.lock().await;
            if let Some(job) = state.jobs.get_mut(&key) {
                // A cancel or reCreate during the delay wins over the retry.
                if job.id == job_id && job.status == JobStatus::Processing {
                    job.status = JobStatus::Queued;
                    job.updated_at = Utc::now();
                }
            }
        }
        inner.wake.notify_one();
    });
}

/// Bounded retention of terminal jobs: the oldest are evicted once the
/// terminal set exceeds a fixed multiple of the queue capacity.
fn prune_terminal(state: &mut QueueState, max_size: usize) {
    let limit = max_size * TERMINAL_RETENTION_FACTOR;
    let mut terminal: Vec<(String, DateTime<Utc>)> = state
        .jobs
        .values()
        .filter(|j| j.status.is_terminal())
        .map(|j| (j.requested_key.clone(), j.updated_at))
        .collect();
    if terminal.len() <= limit {
        return;
    }
    terminal.sort_by_key(|(_, updated_at)| *updated_at);
    for (key, _) in terminal.iter().take(terminal.len() - limit) {
        state.jobs.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{
        BrowserSettingsUpdate, QueueSettingsUpdate, Settings, SettingsUpdate,
    };
    use crate::testutil::FakeFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_store(max_concurrent: usize, max_size: usize, retry_attempts: u32) -> Arc<SettingsStore> {
        let store = SettingsStore::new(Settings::default()).unwrap();
        store
            .update(SettingsUpdate {
                browser: Some(BrowserSettingsUpdate {
                    max_concurrent: Some(max_concurrent),
                    acquire_timeout_ms: Some(2_000),
                    ..Default::default()
                }),
                queue: Some(QueueSettingsUpdate {
                    max_size: Some(max_size),
                    retry_attempts: Some(retry_attempts),
                    retry_delay_ms: Some(10),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
        Arc::new(store)
    }

    fn job_options(settings: &Settings, priority: i32) -> JobOptions {
        JobOptions {
            browser: BrowserJobOptions {
                timeout_ms: settings.browser.default_timeout_ms,
                viewport: settings.browser.viewport.clone(),
            },
            media: MediaOptions::Pdf(PdfOptions {
                format: settings.pdf.default_format,
                landscape: settings.pdf.landscape,
                print_background: settings.pdf.print_background,
                margin: settings.pdf.margin.clone(),
            }),
            queue: QueueJobOptions {
                priority,
                processing_timeout_ms: settings.queue.processing_timeout_ms,
                retry_attempts: settings.queue.retry_attempts,
                retry_delay_ms: settings.queue.retry_delay_ms,
            },
        }
    }

    fn new_job(store: &SettingsStore, key: &str, priority: i32) -> NewJob {
        NewJob {
            requested_key: key.to_string(),
            source: JobSource::Html("<html><body>test</body></html>".to_string()),
            options: job_options(&store.get(), priority),
            re_create: false,
        }
    }

    /// Executor scripted to fail a number of times before succeeding,
    /// recording execution order along the way.
    struct ScriptedExecutor {
        fail_first: usize,
        calls: AtomicUsize,
        order: StdMutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedExecutor {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
                order: StdMutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(0)
            }
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            job: &Job,
            _context: Arc<dyn RenderContext>,
            cancel: &CancellationToken,
            progress: &ProgressReporter,
        ) -> Result<PathBuf, RenderError> {
            self.order.lock().unwrap().push(job.requested_key.clone());
            progress.set(50).await;

            if self.delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(RenderError::Cancelled),
                }
            }

            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(RenderError::RenderFailed("synthetic failure".to_string()))
            } else {
                Ok(PathBuf::from(format!("/tmp/out/{}.pdf", job.requested_key)))
            }
        }
    }

    fn make_queue(
        store: Arc<SettingsStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> RenderQueue {
        let pool = WorkerPool::new(store.clone(), Arc::new(FakeFactory::new()));
        RenderQueue::new("test", store, pool, executor)
    }

    async fn wait_for_terminal(queue: &RenderQueue, key: &str) -> Job {
        for _ in 0..500 {
            let job = queue.job_status(key).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {key} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_admits_job_as_queued() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        let job = queue.submit(new_job(&store, "job-1", DEFAULT_PRIORITY)).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 0);

        let looked_up = queue.job_status("job-1").await.unwrap();
        assert_eq!(looked_up.status, JobStatus::Queued);
        assert!(looked_up.file_path.is_none());
        assert!(looked_up.error.is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        for key in ["", "has space", "bad/slash", &"x".repeat(256)] {
            let mut job = new_job(&store, key, DEFAULT_PRIORITY);
            job.requested_key = key.to_string();
            assert!(matches!(
                queue.submit(job).await.unwrap_err(),
                RenderError::Validation(_)
            ));
        }
    }

    #[tokio::test]
    async fn duplicate_active_key_is_rejected_without_recreate() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        queue.submit(new_job(&store, "dup", DEFAULT_PRIORITY)).await.unwrap();
        let err = queue.submit(new_job(&store, "dup", DEFAULT_PRIORITY)).await.unwrap_err();
        assert!(matches!(err, RenderError::DuplicateKey(_)));

        let mut recreate = new_job(&store, "dup", DEFAULT_PRIORITY);
        recreate.re_create = true;
        let job = queue.submit(recreate).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_creating_a_record() {
        let store = test_store(1, 2, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        queue.submit(new_job(&store, "a", DEFAULT_PRIORITY)).await.unwrap();
        queue.submit(new_job(&store, "b", DEFAULT_PRIORITY)).await.unwrap();

        let err = queue.submit(new_job(&store, "c", DEFAULT_PRIORITY)).await.unwrap_err();
        assert!(matches!(err, RenderError::QueueFull { size: 2, max: 2 }));
        assert!(matches!(
            queue.job_status("c").await.unwrap_err(),
            RenderError::NotFound(_)
        ));

        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn recreate_is_admitted_when_the_queue_is_full() {
        let store = test_store(1, 1, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        queue.submit(new_job(&store, "solo", DEFAULT_PRIORITY)).await.unwrap();
        assert!(matches!(
            queue.submit(new_job(&store, "other", DEFAULT_PRIORITY)).await.unwrap_err(),
            RenderError::QueueFull { .. }
        ));

        // Replacing the active job does not raise the active count, so it is
        // admitted even at capacity.
        let mut recreate = new_job(&store, "solo", DEFAULT_PRIORITY);
        recreate.re_create = true;
        let job = queue.submit(recreate).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let stats = queue.stats().await;
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.totals.submitted, 2);
        assert_eq!(stats.totals.cancelled, 1);
    }

    #[tokio::test]
    async fn dispatches_by_priority_then_fifo() {
        let store = test_store(1, 10, 0);
        let executor = Arc::new(ScriptedExecutor::new(0));
        let queue = make_queue(store.clone(), executor.clone());

        queue.submit(new_job(&store, "a", 1)).await.unwrap();
        queue.submit(new_job(&store, "b", 5)).await.unwrap();
        queue.submit(new_job(&store, "c", 5)).await.unwrap();

        let handle = queue.start();
        for key in ["a", "b", "c"] {
            let job = wait_for_terminal(&queue, key).await;
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(executor.order(), vec!["b", "c", "a"]);

        queue.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn completed_job_has_path_and_full_progress() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        queue.submit(new_job(&store, "done", DEFAULT_PRIORITY)).await.unwrap();
        queue.start();

        let job = wait_for_terminal(&queue, "done").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.file_path, Some(PathBuf::from("/tmp/out/done.pdf")));
        assert!(job.error.is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_never_dispatched() {
        let store = test_store(1, 10, 0);
        let executor = Arc::new(ScriptedExecutor::new(0));
        let queue = make_queue(store.clone(), executor.clone());

        queue.submit(new_job(&store, "doomed", DEFAULT_PRIORITY)).await.unwrap();
        let job = queue.cancel("doomed").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());

        queue.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.order().is_empty());
        assert_eq!(
            queue.job_status("doomed").await.unwrap().status,
            JobStatus::Cancelled
        );
        queue.shutdown();
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_and_unknown_jobs() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        assert!(matches!(
            queue.cancel("missing").await.unwrap_err(),
            RenderError::NotFound(_)
        ));

        queue.submit(new_job(&store, "done", DEFAULT_PRIORITY)).await.unwrap();
        queue.start();
        wait_for_terminal(&queue, "done").await;

        let err = queue.cancel("done").await.unwrap_err();
        assert!(matches!(err, RenderError::InvalidState(_)));
        assert!(err.to_string().contains("completed"));
        queue.shutdown();
    }

    #[tokio::test]
    async fn cancelling_processing_job_updates_record_immediately() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(
            store.clone(),
            Arc::new(ScriptedExecutor::slow(Duration::from_secs(5))),
        );

        queue.submit(new_job(&store, "slow", DEFAULT_PRIORITY)).await.unwrap();
        queue.start();

        // Wait for the dispatch.
        for _ in 0..200 {
            if queue.job_status("slow").await.unwrap().status == JobStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let job = queue.cancel("slow").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The cooperative abort settles; the record must stay cancelled with
        // no artifact attached.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = queue.job_status("slow").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.file_path.is_none());
        assert!(job.error.is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let store = test_store(1, 10, 2);
        let executor = Arc::new(ScriptedExecutor::new(2));
        let queue = make_queue(store.clone(), executor.clone());

        queue.submit(new_job(&store, "flaky", DEFAULT_PRIORITY)).await.unwrap();
        queue.start();

        let job = wait_for_terminal(&queue, "flaky").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.is_none());
        assert_eq!(queue.stats().await.totals.retries, 2);
        queue.shutdown();
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_error() {
        let store = test_store(1, 10, 2);
        let executor = Arc::new(ScriptedExecutor::new(usize::MAX));
        let queue = make_queue(store.clone(), executor.clone());

        queue.submit(new_job(&store, "broken", DEFAULT_PRIORITY)).await.unwrap();
        queue.start();

        let job = wait_for_terminal(&queue, "broken").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.as_deref().unwrap().contains("synthetic failure"));
        assert!(job.file_path.is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn processing_timeout_is_a_transient_failure() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(
            store.clone(),
            Arc::new(ScriptedExecutor::slow(Duration::from_secs(30))),
        );

        let mut job = new_job(&store, "stuck", DEFAULT_PRIORITY);
        job.options.queue.processing_timeout_ms = 50;
        queue.submit(job).await.unwrap();
        queue.start();

        let job = wait_for_terminal(&queue, "stuck").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.as_deref().unwrap().contains("timeout"));
        queue.shutdown();
    }

    #[tokio::test]
    async fn stats_reflect_retained_jobs() {
        let store = test_store(1, 10, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));

        queue.submit(new_job(&store, "q1", DEFAULT_PRIORITY)).await.unwrap();
        queue.submit(new_job(&store, "q2", DEFAULT_PRIORITY)).await.unwrap();
        queue.cancel("q2").await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.totals.submitted, 2);
        assert_eq!(stats.totals.cancelled, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_evicted_beyond_retention() {
        let store = test_store(1, 1, 0);
        let queue = make_queue(store.clone(), Arc::new(ScriptedExecutor::new(0)));
        queue.start();

        for i in 0..4 {
            let key = format!("job-{i}");
            let mut job = new_job(&store, &key, DEFAULT_PRIORITY);
            job.requested_key = key.clone();
            queue.submit(job).await.unwrap();
            wait_for_terminal(&queue, &key).await;
        }

        // max_size 1, retention factor 2: only the two newest terminal jobs
        // survive.
        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
        assert!(matches!(
            queue.job_status("job-0").await.unwrap_err(),
            RenderError::NotFound(_)
        ));
        assert!(queue.job_status("job-3").await.is_ok());
        queue.shutdown();
    }
}
