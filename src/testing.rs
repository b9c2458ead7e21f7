//! Scriptable in-memory rendering engine for tests.
//!
//! A capture of a fake context produces `PNG:<displayed document>`, so tests
//! can read back what would have been on screen. Page signals are buffered
//! like browser events and only reach the collector when the subscription is
//! drained.

use crate::{
    ConsoleError, RenderContext, RenderEngine, ScreenshotError, SignalCollector, Subscription,
    Viewport, WaitCondition,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// How a fake context reacts to navigating to a given URL.
#[derive(Clone)]
pub(crate) enum Behavior {
    Load,
    ConsoleError(String),
    RequestFailed(String),
    Fail(String),
    Hang,
    /// Blocks until the gate has permits.
    Gate(Arc<Semaphore>),
    /// Never finishes loading, and logs a console error some time after the
    /// navigation was abandoned unless the tab is reset.
    LateConsoleError(String),
    /// The tab dies while navigating.
    Crash,
    /// Loads, but every later capture on this context fails.
    BrokenCapture,
}

#[derive(Default)]
pub(crate) struct Script {
    behaviors: Mutex<HashMap<String, Behavior>>,
    navigations: Mutex<Vec<String>>,
}

impl Script {
    fn behavior(&self, url: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Behavior::Load)
    }
}

enum Signal {
    Console(ConsoleError),
    RequestFailed(String),
}

pub(crate) struct ContextState {
    pub id: usize,
    live: AtomicBool,
    closed: AtomicBool,
    broken_capture: AtomicBool,
    displayed: Mutex<String>,
    subscribed: AtomicBool,
    buffered: Mutex<Vec<Signal>>,
    late_error: Mutex<Option<ConsoleError>>,
    active_subscriptions: AtomicUsize,
    captures: AtomicUsize,
    resets: AtomicUsize,
}

impl ContextState {
    fn new(id: usize) -> Self {
        Self {
            id,
            live: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            broken_capture: AtomicBool::new(false),
            displayed: Mutex::new("about:blank".to_string()),
            subscribed: AtomicBool::new(false),
            buffered: Mutex::new(Vec::new()),
            late_error: Mutex::new(None),
            active_subscriptions: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn kill(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn displayed(&self) -> String {
        self.displayed.lock().unwrap().clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    fn show(&self, document: String) {
        *self.displayed.lock().unwrap() = document;
    }

    /// Events emitted while nobody listens are lost, as in the browser.
    fn emit(&self, signal: Signal) {
        if self.subscribed.load(Ordering::SeqCst) {
            self.buffered.lock().unwrap().push(signal);
        }
    }

    fn drain_into(&self, collector: &SignalCollector) {
        for signal in self.buffered.lock().unwrap().drain(..) {
            match signal {
                Signal::Console(error) => collector.record_console_error(error),
                Signal::RequestFailed(text) => collector.record_request_failure(text),
            }
        }
    }
}

fn console_error(text: String, url: &str) -> ConsoleError {
    ConsoleError {
        text,
        url: format!("{url}/app.js"),
        line: 3,
        column: 14,
    }
}

pub(crate) struct FakeContext {
    state: Arc<ContextState>,
    script: Arc<Script>,
}

impl FakeContext {
    /// A context that belongs to no engine and loads every URL cleanly.
    pub fn detached(id: usize) -> (Self, Arc<ContextState>) {
        let state = Arc::new(ContextState::new(id));
        let context = Self {
            state: state.clone(),
            script: Arc::new(Script::default()),
        };
        (context, state)
    }
}

#[async_trait]
impl RenderContext for FakeContext {
    fn id(&self) -> usize {
        self.state.id
    }

    async fn subscribe(&self, collector: SignalCollector) -> Result<Subscription, ScreenshotError> {
        self.state.buffered.lock().unwrap().clear();
        self.state.subscribed.store(true, Ordering::SeqCst);
        self.state.active_subscriptions.fetch_add(1, Ordering::SeqCst);

        // an abandoned page that is still loading keeps logging
        if let Some(error) = self.state.late_error.lock().unwrap().clone() {
            self.state.emit(Signal::Console(error));
        }

        let drained = self.state.clone();
        let detached = self.state.clone();
        Ok(Subscription::new()
            .with_drain(move || drained.drain_into(&collector))
            .on_detach(move || {
                detached.subscribed.store(false, Ordering::SeqCst);
                detached.buffered.lock().unwrap().clear();
                detached.active_subscriptions.fetch_sub(1, Ordering::SeqCst);
            }))
    }

    async fn navigate(&self, url: &str, _wait_until: WaitCondition) -> Result<(), ScreenshotError> {
        self.script.navigations.lock().unwrap().push(url.to_string());
        if !self.is_live() {
            return Err(ScreenshotError::NavigationFailed("Target closed".to_string()));
        }

        match self.script.behavior(url) {
            Behavior::Load => {}
            Behavior::ConsoleError(text) => {
                self.state.emit(Signal::Console(console_error(text, url)));
            }
            Behavior::RequestFailed(text) => self.state.emit(Signal::RequestFailed(text)),
            Behavior::Fail(message) => return Err(ScreenshotError::NavigationFailed(message)),
            Behavior::Hang => futures::future::pending::<()>().await,
            Behavior::LateConsoleError(text) => {
                *self.state.late_error.lock().unwrap() = Some(console_error(text, url));
                futures::future::pending::<()>().await
            }
            Behavior::Gate(gate) => {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| ScreenshotError::NavigationFailed(e.to_string()))?;
            }
            Behavior::Crash => {
                self.state.kill();
                return Err(ScreenshotError::NavigationFailed("Target closed".to_string()));
            }
            Behavior::BrokenCapture => self.state.broken_capture.store(true, Ordering::SeqCst),
        }

        self.state.show(format!("page:{url}"));
        Ok(())
    }

    async fn capture(&self, _full_page: bool) -> Result<Vec<u8>, ScreenshotError> {
        if !self.is_live() || self.state.broken_capture.load(Ordering::SeqCst) {
            return Err(ScreenshotError::CaptureFailed("target unavailable".to_string()));
        }
        self.state.captures.fetch_add(1, Ordering::SeqCst);
        Ok(format!("PNG:{}", self.state.displayed()).into_bytes())
    }

    async fn set_content(&self, html: &str) -> Result<(), ScreenshotError> {
        if !self.is_live() {
            return Err(ScreenshotError::ContentFailed("target unavailable".to_string()));
        }
        self.state.show(html.to_string());
        Ok(())
    }

    async fn reset(&self) -> Result<(), ScreenshotError> {
        if !self.is_live() {
            return Err(ScreenshotError::NavigationFailed("Target closed".to_string()));
        }
        *self.state.late_error.lock().unwrap() = None;
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        self.state.show("about:blank".to_string());
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.kill();
    }

    fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    script: Arc<Script>,
    contexts: Mutex<Vec<Arc<ContextState>>>,
    refuse_new_contexts: AtomicBool,
    shut_down: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, behavior: Behavior) {
        self.script
            .behaviors
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
    }

    /// URLs in the order navigation started.
    pub fn navigations(&self) -> Vec<String> {
        self.script.navigations.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<Arc<ContextState>> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn refuse_new_contexts(&self, refuse: bool) {
        self.refuse_new_contexts.store(refuse, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn new_context(
        &self,
        _viewport: &Viewport,
    ) -> Result<Box<dyn RenderContext>, ScreenshotError> {
        if self.refuse_new_contexts.load(Ordering::SeqCst) {
            return Err(ScreenshotError::ContextCreationFailed(
                "engine refused".to_string(),
            ));
        }

        let mut contexts = self.contexts.lock().unwrap();
        let state = Arc::new(ContextState::new(contexts.len()));
        contexts.push(state.clone());

        Ok(Box::new(FakeContext {
            state,
            script: self.script.clone(),
        }))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for state in self.contexts.lock().unwrap().iter() {
            state.kill();
        }
    }
}
