//! Test doubles for the rendering capability.

use crate::renderer::{ContextFactory, RenderContext, RenderRequest};
use crate::RenderError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-memory render context that returns a fixed payload after an optional
/// delay, honoring cancellation like the real browser context.
pub struct FakeContext {
    alive: AtomicBool,
    payload: Vec<u8>,
    delay: Duration,
}

impl FakeContext {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderContext for FakeContext {
    async fn render(
        &self,
        _request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(self.payload.clone()),
            _ = cancel.cancelled() => Err(RenderError::Cancelled),
        }
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.kill();
    }
}

pub struct FakeFactory {
    created: AtomicUsize,
    contexts: Mutex<Vec<Arc<FakeContext>>>,
    payload: Vec<u8>,
    delay: Duration,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::with_render(b"%PDF-fake".to_vec(), Duration::ZERO)
    }

    pub fn with_render(payload: Vec<u8>, delay: Duration) -> Self {
        Self {
            created: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            payload,
            delay,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Simulates every live browser crashing at once.
    pub fn kill_all(&self) {
        for context in self.contexts.lock().unwrap().iter() {
            context.kill();
        }
    }
}

#[async_trait]
impl ContextFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn RenderContext>, RenderError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let context = Arc::new(FakeContext {
            alive: AtomicBool::new(true),
            payload: self.payload.clone(),
            delay: self.delay,
        });
        self.contexts.lock().unwrap().push(context.clone());
        Ok(context)
    }
}
