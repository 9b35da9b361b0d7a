//! Bounded pool of rendering contexts
//!
//! Capacity is re-read from the live settings snapshot on every acquire, so a
//! settings change resizes the pool without a restart: shrinking lets in-use
//! slots finish and simply refuses new acquisitions beyond the new limit,
//! growing wakes waiters immediately. Contexts are created lazily, reused
//! while healthy, and discarded on release when their browser has died.

use crate::renderer::{ContextFactory, RenderContext};
use crate::settings::SettingsStore;
use crate::RenderError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct PoolState {
    in_use: usize,
    idle: Vec<Arc<dyn RenderContext>>,
    contexts_created: usize,
    contexts_discarded: usize,
}

struct PoolInner {
    settings: Arc<SettingsStore>,
    factory: Arc<dyn ContextFactory>,
    state: Mutex<PoolState>,
    freed: Notify,
}

/// A unit of browser capacity owned by exactly one in-flight job.
pub struct Slot {
    context: Arc<dyn RenderContext>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl Slot {
    pub fn context(&self) -> Arc<dyn RenderContext> {
        self.context.clone()
    }

    /// Returns capacity to the pool. The context is health-checked here: a
    /// dead browser is discarded and lazily replaced instead of being handed
    /// to the next job.
    pub async fn release(mut self) {
        self.released = true;
        let context = self.context.clone();
        let pool = self.pool.clone();
        release_context(&pool, context).await;
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.released {
            let context = self.context.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                release_context(&pool, context).await;
            });
        }
    }
}

async fn release_context(pool: &Arc<PoolInner>, context: Arc<dyn RenderContext>) {
    let healthy = context.is_healthy();
    let kept = {
        let mut state = pool.state.lock().await;
        state.in_use -= 1;
        let limit = pool.settings.get().browser.max_concurrent;
        let keep = healthy && state.in_use + state.idle.len() < limit;
        if keep {
            state.idle.push(context.clone());
        } else {
            state.contexts_discarded += 1;
        }
        keep
    };
    if !kept {
        if !healthy {
            warn!("Discarding unhealthy render context");
        }
        context.close().await;
    }
    pool.freed.notify_one();
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub limit: usize,
    pub in_use: usize,
    pub idle: usize,
    pub contexts_created: usize,
    pub contexts_discarded: usize,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(settings: Arc<SettingsStore>, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                factory,
                state: Mutex::new(PoolState {
                    in_use: 0,
                    idle: Vec::new(),
                    contexts_created: 0,
                    contexts_discarded: 0,
                }),
                freed: Notify::new(),
            }),
        }
    }

    /// Suspends until a slot is free or the pool-level acquire timeout
    /// elapses. This guards against total pool starvation and is distinct
    /// from the per-job processing timeout.
    pub async fn acquire(&self) -> Result<Slot, RenderError> {
        let acquire_timeout = self.inner.settings.get().acquire_timeout();
        match timeout(acquire_timeout, self.acquire_inner()).await {
            Ok(slot) => slot,
            Err(_) => Err(RenderError::PoolTimeout(acquire_timeout)),
        }
    }

    async fn acquire_inner(&self) -> Result<Slot, RenderError> {
        let mut settings_rx = self.inner.settings.subscribe();
        loop {
            let (reused, stale) = {
                let mut state = self.inner.state.lock().await;
                let limit = self.inner.settings.get().browser.max_concurrent;
                if state.in_use < limit {
                    // Reserve the slot before any slow context creation.
                    state.in_use += 1;
                    // Contexts can die while idle; never hand one out.
                    let mut stale = Vec::new();
                    let mut healthy = None;
                    while let Some(context) = state.idle.pop() {
                        if context.is_healthy() {
                            healthy = Some(context);
                            break;
                        }
                        state.contexts_discarded += 1;
                        stale.push(context);
                    }
                    (Some(healthy), stale)
                } else {
                    (None, Vec::new())
                }
            };

            for context in stale {
                warn!("Discarding render context that died while idle");
                context.close().await;
            }

            match reused {
                Some(Some(context)) => {
                    return Ok(Slot {
                        context,
                        pool: self.inner.clone(),
                        released: false,
                    })
                }
                Some(None) => {
                    // No idle context; create one outside the lock.
                    match self.inner.factory.create().await {
                        Ok(context) => {
                            self.inner.state.lock().await.contexts_created += 1;
                            return Ok(Slot {
                                context,
                                pool: self.inner.clone(),
                                released: false,
                            });
                        }
                        Err(e) => {
                            let mut state = self.inner.state.lock().await;
                            state.in_use -= 1;
                            drop(state);
                            self.inner.freed.notify_one();
                            return Err(e);
                        }
                    }
                }
                None => {
                    // At capacity: wait for a release or for the limit to grow.
                    tokio::select! {
                        _ = self.inner.freed.notified() => {}
                        _ = settings_rx.changed() => {
                            debug!("Pool capacity settings changed, re-checking");
                        }
                    }
                }
            }
        }
    }

    /// Slots not currently reserved under the live limit. Used by the
    /// scheduler to avoid marking jobs as processing it cannot place.
    pub async fn free_capacity(&self) -> usize {
        let state = self.inner.state.lock().await;
        let limit = self.inner.settings.get().browser.max_concurrent;
        limit.saturating_sub(state.in_use)
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            limit: self.inner.settings.get().browser.max_concurrent,
            in_use: state.in_use,
            idle: state.idle.len(),
            contexts_created: state.contexts_created,
            contexts_discarded: state.contexts_discarded,
        }
    }

    /// Closes all idle contexts. In-use slots drain through their owners.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.state.lock().await;
            std::mem::take(&mut state.idle)
        };
        for context in idle {
            context.close().await;
        }
        info!("Worker pool shut down");
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
