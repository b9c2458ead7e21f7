//! Request dispatcher and owner of the pool/queue state
//!
//! All shared mutable state (the pool of idle contexts and the admission
//! queue) lives behind one mutex in [`Dispatcher`]. The lock is only held for
//! the bookkeeping itself, never across navigation or capture, so a context
//! is checked out for the whole capture while other requests keep flowing.

use crate::{
    metrics, AdmissionEntry, AdmissionQueue, CapturePipeline, CaptureRequest, CaptureResponse,
    Config, ContextPool, PoolStats, PooledContext, QueueStats, Released, RenderContext,
    RenderEngine, ScreenshotError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Slots {
    pool: ContextPool,
    queue: AdmissionQueue,
    shutting_down: bool,
}

struct Shared {
    slots: Mutex<Slots>,
    pipeline: CapturePipeline,
    runtime: Handle,
    replace_discarded: bool,
    served: AtomicU64,
    replacements_failed: AtomicU64,
}

/// Entry point for captures.
///
/// # Examples
///
/// ```rust,no_run
/// use screenshot_server::{CaptureRequest, ChromeEngine, Config, Dispatcher};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let engine = Arc::new(ChromeEngine::launch(&config).await?);
///     let dispatcher = Dispatcher::start(&config, engine).await?;
///
///     let artifact = dispatcher.handle(CaptureRequest::new("https://example.com")).await?;
///     println!("{} bytes ({})", artifact.bytes.len(), artifact.outcome.label());
///
///     dispatcher.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Creates `config.pool_size` contexts up front. Fails if any of them
    /// cannot be created.
    pub async fn start(
        config: &Config,
        engine: Arc<dyn RenderEngine>,
    ) -> Result<Self, ScreenshotError> {
        config.validate()?;

        let mut contexts: Vec<PooledContext> = Vec::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            match engine.new_context(&config.viewport).await {
                Ok(context) => {
                    info!("Rendering context {} created successfully", i);
                    contexts.push(context);
                }
                Err(e) => {
                    error!("Failed to create rendering context {}: {}", i, e);
                    for context in contexts {
                        context.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!("Context pool initialized with {} contexts", contexts.len());
        metrics::set_idle_contexts(contexts.len());

        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots {
                pool: ContextPool::with_contexts(contexts),
                queue: AdmissionQueue::new(),
                shutting_down: false,
            }),
            pipeline: CapturePipeline::new(engine, config),
            runtime: Handle::current(),
            replace_discarded: config.replace_discarded_contexts,
            served: AtomicU64::new(0),
            replacements_failed: AtomicU64::new(0),
        });

        Ok(Self { shared })
    }

    /// Starts the capture right away when a context is idle, otherwise queues
    /// it. Never blocks.
    pub fn dispatch(&self, request: CaptureRequest) -> PendingCapture {
        let (responder, receiver) = oneshot::channel();
        let entry = AdmissionEntry::new(request, responder);

        let ready = {
            let mut slots = self.shared.lock();
            if slots.shutting_down {
                drop(slots);
                entry.reject(ScreenshotError::ShuttingDown);
                return PendingCapture { receiver };
            }

            match slots.pool.acquire() {
                Some(context) => {
                    metrics::set_idle_contexts(slots.pool.idle_count());
                    Some((context, entry))
                }
                None => {
                    debug!(
                        "No idle context, queueing {} for {}",
                        entry.request.id, entry.request.url
                    );
                    slots.queue.enqueue(entry);
                    metrics::set_queue_depth(slots.queue.len());
                    None
                }
            }
        };

        if let Some((context, entry)) = ready {
            self.shared.start_capture(context, entry);
        }

        PendingCapture { receiver }
    }

    pub async fn handle(&self, request: CaptureRequest) -> CaptureResponse {
        self.dispatch(request).wait().await
    }

    /// Starts the oldest queued capture if a context is idle. Returns whether
    /// one was started.
    pub fn drain_one(&self) -> bool {
        let next = self.shared.take_next(&mut self.shared.lock());
        match next {
            Some((context, entry)) => {
                self.shared.start_capture(context, entry);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let slots = self.shared.lock();
        DispatcherStats {
            pool: slots.pool.stats(),
            queue: slots.queue.stats(),
            served: self.shared.served.load(Ordering::Relaxed),
            replacements_failed: self.shared.replacements_failed.load(Ordering::Relaxed),
            shutting_down: slots.shutting_down,
        }
    }

    /// Rejects everything still queued, waits briefly for in-flight captures
    /// to hand their contexts back, then closes the pool and the engine.
    pub async fn shutdown(&self) {
        self.shutdown_within(SHUTDOWN_GRACE).await
    }

    /// [`Dispatcher::shutdown`] with an explicit wait for in-flight captures.
    /// Contexts released after the wait are closed on release.
    pub async fn shutdown_within(&self, grace: Duration) {
        info!("Shutting down dispatcher...");

        let rejected = {
            let mut slots = self.shared.lock();
            slots.shutting_down = true;
            slots.queue.drain()
        };
        if !rejected.is_empty() {
            warn!("Rejecting {} queued captures", rejected.len());
        }
        for entry in rejected {
            entry.reject(ScreenshotError::ShuttingDown);
        }

        let started = Instant::now();
        while self.shared.lock().pool.stats().in_use > 0 {
            if started.elapsed() >= grace {
                warn!("Captures still running after {:?}, shutting down anyway", grace);
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let idle = self.shared.lock().pool.take_idle();
        for context in idle {
            context.close().await;
        }

        self.shared.pipeline.engine().shutdown().await;
        info!("Dispatcher shutdown complete");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pairs the head of the queue with an idle context, if both exist.
    fn take_next(&self, slots: &mut Slots) -> Option<(PooledContext, AdmissionEntry)> {
        if slots.shutting_down || slots.queue.is_empty() || !slots.pool.has_idle() {
            return None;
        }

        let entry = slots.queue.pop()?;
        let context = slots.pool.acquire()?;

        metrics::set_queue_depth(slots.queue.len());
        metrics::set_idle_contexts(slots.pool.idle_count());
        Some((context, entry))
    }

    fn start_capture(self: &Arc<Self>, context: PooledContext, entry: AdmissionEntry) {
        let lease = ContextLease {
            context: Some(context),
            shared: self.clone(),
        };
        let shared = self.clone();

        self.runtime.spawn(async move {
            let AdmissionEntry {
                request,
                responder,
                enqueued_at,
            } = entry;
            debug!(
                "Starting capture {} for {} after {:?} in queue",
                request.id,
                request.url,
                enqueued_at.elapsed()
            );

            let response = shared.pipeline.run(lease, &request).await;
            shared.served.fetch_add(1, Ordering::Relaxed);

            if responder.send(response).is_err() {
                debug!("Caller for capture {} went away", request.id);
            }
        });
    }

    /// Hands a context back and immediately gives it to the oldest waiter.
    /// Once shutdown has started the context is closed instead.
    fn release(self: &Arc<Self>, context: PooledContext) {
        let (discarded, next, shutting_down) = {
            let mut slots = self.lock();
            if slots.shutting_down {
                let retired = slots.pool.retire(context);
                drop(slots);
                debug!("Closing rendering context {} released during shutdown", retired.id());
                self.close_in_background(retired);
                return;
            }
            let discarded = match slots.pool.release(context) {
                Released::Pooled => None,
                Released::Discarded(dead) => Some(dead),
            };
            let next = self.take_next(&mut slots);
            metrics::set_idle_contexts(slots.pool.idle_count());
            (discarded, next, slots.shutting_down)
        };

        if let Some(dead) = discarded {
            warn!("Rendering context {} is no longer live, discarding it", dead.id());
            metrics::record_context_discarded();
            self.close_in_background(dead);

            if self.replace_discarded && !shutting_down {
                self.spawn_replacement();
            }
        }

        if let Some((context, entry)) = next {
            self.start_capture(context, entry);
        }
    }

    fn spawn_replacement(self: &Arc<Self>) {
        let shared = self.clone();
        self.runtime.spawn(async move {
            let engine = shared.pipeline.engine().clone();
            match engine.new_context(shared.pipeline.viewport()).await {
                Ok(context) => shared.restock(context),
                Err(e) => {
                    shared.replacements_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to replace discarded context, pool runs below capacity: {}",
                        e
                    );
                }
            }
        });
    }

    fn restock(self: &Arc<Self>, context: PooledContext) {
        let (spare, next) = {
            let mut slots = self.lock();
            if slots.shutting_down {
                (Some(context), None)
            } else {
                match slots.pool.restock(context) {
                    Ok(()) => {
                        info!("Replaced discarded rendering context");
                        metrics::record_context_replaced();
                        (None, self.take_next(&mut slots))
                    }
                    Err(spare) => (Some(spare), None),
                }
            }
        };

        if let Some(spare) = spare {
            self.close_in_background(spare);
        }
        if let Some((context, entry)) = next {
            self.start_capture(context, entry);
        }
    }

    fn close_in_background(&self, context: PooledContext) {
        self.runtime.spawn(async move {
            context.close().await;
        });
    }
}

/// Exclusive use of one pooled context for the duration of a capture.
///
/// Dropping the lease returns the context to the pool exactly once and hands
/// it straight to the next queued request, whatever path the capture took.
pub struct ContextLease {
    context: Option<PooledContext>,
    shared: Arc<Shared>,
}

impl ContextLease {
    pub fn context(&self) -> &dyn RenderContext {
        self.context
            .as_deref()
            .expect("lease holds its context until dropped")
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.shared.release(context);
        }
    }
}

/// Response side of a dispatched capture.
pub struct PendingCapture {
    receiver: oneshot::Receiver<CaptureResponse>,
}

impl PendingCapture {
    pub async fn wait(self) -> CaptureResponse {
        self.receiver
            .await
            .unwrap_or(Err(ScreenshotError::RequestDropped))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub served: u64,
    pub replacements_failed: u64,
    pub shutting_down: bool,
}
