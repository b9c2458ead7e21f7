//! Seam between the render-resource pool and the headless browser
//!
//! The pool, dispatcher and capture pipeline only ever talk to rendering
//! contexts through [`RenderContext`]; the browser that backs them lives
//! behind [`RenderEngine`]. Per-capture observers are modelled as a
//! [`Subscription`] guard so that listeners attached to a recycled context
//! never outlive the capture that attached them.

use crate::{ScreenshotError, Viewport, WaitCondition};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Factory for rendering contexts backed by one running browser.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderEngine: Send + Sync + 'static {
    /// Open a new context (browser tab) sized to `viewport`.
    async fn new_context(
        &self,
        viewport: &Viewport,
    ) -> Result<Box<dyn RenderContext>, ScreenshotError>;

    /// Tear the browser down. Contexts become non-live afterwards.
    async fn shutdown(&self);
}

/// One browser tab, owned by exactly one holder at a time.
#[async_trait]
pub trait RenderContext: Send + Sync + 'static {
    fn id(&self) -> usize;

    /// Attach console-error and failed-request observers that report into
    /// `collector` until the returned guard is dropped.
    async fn subscribe(&self, collector: SignalCollector) -> Result<Subscription, ScreenshotError>;

    async fn navigate(&self, url: &str, wait_until: WaitCondition) -> Result<(), ScreenshotError>;

    async fn capture(&self, full_page: bool) -> Result<Vec<u8>, ScreenshotError>;

    /// Replace the displayed document with `html`.
    async fn set_content(&self, html: &str) -> Result<(), ScreenshotError>;

    /// Stops whatever the context is still loading and leaves it on a blank
    /// document, so nothing from an abandoned navigation reaches the next
    /// capture's observers.
    async fn reset(&self) -> Result<(), ScreenshotError>;

    async fn close(&self);

    fn is_live(&self) -> bool;
}

/// A console message of type `error`, with the location that logged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleError {
    pub text: String,
    pub url: String,
    pub line: i64,
    pub column: i64,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.url.is_empty() {
            write!(f, "{}", self.text)
        } else {
            write!(f, "{} ({}:{}:{})", self.text, self.url, self.line, self.column)
        }
    }
}

/// Everything the observers saw during one navigation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    pub console_errors: Vec<ConsoleError>,
    /// Error text of the first sub-resource load that failed.
    pub failed_request: Option<String>,
}

impl PageSignals {
    pub fn is_empty(&self) -> bool {
        self.console_errors.is_empty() && self.failed_request.is_none()
    }
}

/// Shared sink the observers of a single capture write into.
#[derive(Debug, Clone, Default)]
pub struct SignalCollector {
    signals: Arc<Mutex<PageSignals>>,
}

impl SignalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_console_error(&self, error: ConsoleError) {
        self.lock().console_errors.push(error);
    }

    /// Only the first failure is kept.
    pub fn record_request_failure(&self, error_text: impl Into<String>) {
        let mut signals = self.lock();
        if signals.failed_request.is_none() {
            signals.failed_request = Some(error_text.into());
        }
    }

    pub fn snapshot(&self) -> PageSignals {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageSignals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped observer registration.
///
/// Events are buffered by the engine while the capture runs and only reach
/// the collector when [`Subscription::drain`] is called. Dropping the guard
/// discards anything not yet drained and runs the detach hooks, on every
/// exit path of the capture that created it.
#[derive(Default)]
pub struct Subscription {
    drains: Vec<Box<dyn FnMut() + Send>>,
    detach_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure that moves every event already buffered into the
    /// collector without waiting for more.
    pub fn with_drain(mut self, drain: impl FnMut() + Send + 'static) -> Self {
        self.drains.push(Box::new(drain));
        self
    }

    pub fn drain(&mut self) {
        for drain in self.drains.iter_mut() {
            drain();
        }
    }

    pub fn on_detach(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.detach_hooks.push(Box::new(hook));
        self
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.drains.clear();
        for hook in std::mem::take(&mut self.detach_hooks) {
            hook();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("drains", &self.drains.len())
            .field("detach_hooks", &self.detach_hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_collector_keeps_first_request_failure() {
        let collector = SignalCollector::new();
        collector.record_request_failure("net::ERR_FAILED");
        collector.record_request_failure("net::ERR_ABORTED");

        let signals = collector.snapshot();
        assert_eq!(signals.failed_request.as_deref(), Some("net::ERR_FAILED"));
        assert!(signals.console_errors.is_empty());
        assert!(!signals.is_empty());
    }

    #[test]
    fn test_collector_accumulates_console_errors() {
        let collector = SignalCollector::new();
        let shared = collector.clone();
        for i in 0..3 {
            shared.record_console_error(ConsoleError {
                text: format!("boom {i}"),
                url: "https://example.com/app.js".to_string(),
                line: i,
                column: 7,
            });
        }
        assert_eq!(collector.snapshot().console_errors.len(), 3);
    }

    #[test]
    fn test_console_error_display() {
        let located = ConsoleError {
            text: "Uncaught TypeError".to_string(),
            url: "https://example.com/app.js".to_string(),
            line: 12,
            column: 4,
        };
        assert_eq!(
            located.to_string(),
            "Uncaught TypeError (https://example.com/app.js:12:4)"
        );

        let bare = ConsoleError {
            text: "oops".to_string(),
            url: String::new(),
            line: 0,
            column: 0,
        };
        assert_eq!(bare.to_string(), "oops");
    }

    #[test]
    fn test_subscription_runs_detach_hooks_once() {
        let detached = Arc::new(AtomicUsize::new(0));
        let counter = detached.clone();
        let counter2 = detached.clone();

        let subscription = Subscription::new()
            .on_detach(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_detach(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(detached.load(Ordering::SeqCst), 0);

        drop(subscription);
        assert_eq!(detached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drain_moves_buffered_events_into_collector() {
        let (events_tx, mut events_rx) = futures::channel::mpsc::unbounded::<String>();
        let collector = SignalCollector::new();
        let sink = collector.clone();

        let mut subscription = Subscription::new().with_drain(move || {
            while let Some(Some(text)) = events_rx.next().now_or_never() {
                sink.record_request_failure(text);
            }
        });

        events_tx.unbounded_send("net::ERR_FAILED".to_string()).unwrap();
        assert!(collector.snapshot().is_empty());

        subscription.drain();
        assert_eq!(
            collector.snapshot().failed_request.as_deref(),
            Some("net::ERR_FAILED")
        );
    }

    #[test]
    fn test_dropped_subscription_discards_undrained_events() {
        let (events_tx, mut events_rx) = futures::channel::mpsc::unbounded::<String>();
        let collector = SignalCollector::new();
        let sink = collector.clone();

        let subscription = Subscription::new().with_drain(move || {
            while let Some(Some(text)) = events_rx.next().now_or_never() {
                sink.record_request_failure(text);
            }
        });
        drop(subscription);

        assert!(events_tx.unbounded_send("late".to_string()).is_err());
        assert!(collector.snapshot().is_empty());
    }
}
