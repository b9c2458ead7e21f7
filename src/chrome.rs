//! Headless Chrome rendering engine
//!
//! One Chrome process is launched per server. Every rendering context is a
//! tab of that process, driven over the Chrome DevTools Protocol by
//! chromiumoxide.

use crate::{
    create_browser_config, Config, ConsoleError, RenderContext, RenderEngine, ScreenshotError,
    SignalCollector, Subscription, Viewport, WaitCondition,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::inspector::{
    EnableParams as InspectorEnableParams, EventDetached, EventTargetCrashed,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, StopLoadingParams};
use chromiumoxide::cdp::js_protocol::runtime::{
    ConsoleApiCalledType, EnableParams as RuntimeEnableParams, EventConsoleApiCalled,
    RemoteObject,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{FutureExt, Stream, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub struct ChromeEngine {
    browser: Mutex<Browser>,
    handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    browser_alive: Arc<AtomicBool>,
    next_context_id: AtomicUsize,
}

impl ChromeEngine {
    pub async fn launch(config: &Config) -> Result<Self, ScreenshotError> {
        let browser_config = create_browser_config(config)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScreenshotError::BrowserLaunchFailed(e.to_string()))?;

        let browser_alive = Arc::new(AtomicBool::new(true));
        let alive = browser_alive.clone();

        // The handler implements Stream and must be polled for the browser to make progress
        let handler = tokio::spawn(async move {
            let result = loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Handler error: {}", e);
                        break Err(e);
                    }
                    None => {
                        info!("Handler stream ended");
                        break Ok(());
                    }
                }
            };
            alive.store(false, Ordering::SeqCst);
            result
        });

        info!("Chrome launched");

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            browser_alive,
            next_context_id: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RenderEngine for ChromeEngine {
    async fn new_context(
        &self,
        viewport: &Viewport,
    ) -> Result<Box<dyn RenderContext>, ScreenshotError> {
        if !self.browser_alive.load(Ordering::SeqCst) {
            return Err(ScreenshotError::ContextCreationFailed(
                "browser is not running".to_string(),
            ));
        }

        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| ScreenshotError::ContextCreationFailed(e.to_string()))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(ScreenshotError::ContextCreationFailed)?;

        page.execute(metrics)
            .await
            .map_err(|e| ScreenshotError::ContextCreationFailed(e.to_string()))?;

        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        let liveness = Arc::new(TabLiveness::new(self.browser_alive.clone()));
        let crash_watch = watch_tab(&page, id, liveness.clone()).await?;
        debug!("Opened rendering context {}", id);

        Ok(Box::new(ChromeContext {
            id,
            page,
            liveness,
            crash_watch,
        }))
    }

    async fn shutdown(&self) {
        info!("Shutting down Chrome...");
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
        self.browser_alive.store(false, Ordering::SeqCst);
    }
}

/// Whether a tab can still render. Turns false when we close the tab, when
/// its renderer crashes or detaches, or when the whole browser goes away.
#[derive(Debug)]
struct TabLiveness {
    closed: AtomicBool,
    crashed: AtomicBool,
    browser_alive: Arc<AtomicBool>,
}

impl TabLiveness {
    fn new(browser_alive: Arc<AtomicBool>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            browser_alive,
        }
    }

    /// Returns true only for the first call.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && !self.crashed.load(Ordering::SeqCst)
            && self.browser_alive.load(Ordering::SeqCst)
    }
}

/// Listens for `Inspector.targetCrashed` and `Inspector.detached` on `page`
/// for as long as the tab is open.
async fn watch_tab(
    page: &Page,
    id: usize,
    liveness: Arc<TabLiveness>,
) -> Result<JoinHandle<()>, ScreenshotError> {
    page.execute(InspectorEnableParams::default())
        .await
        .map_err(|e| ScreenshotError::ContextCreationFailed(e.to_string()))?;

    let crashed = page
        .event_listener::<EventTargetCrashed>()
        .await
        .map_err(|e| ScreenshotError::ContextCreationFailed(e.to_string()))?
        .map(|_| "renderer crashed".to_string());
    let detached = page
        .event_listener::<EventDetached>()
        .await
        .map_err(|e| ScreenshotError::ContextCreationFailed(e.to_string()))?
        .map(|event| format!("inspector detached: {}", event.reason));

    Ok(tokio::spawn(watch_for_crash(
        futures::stream::select(crashed, detached),
        id,
        liveness,
    )))
}

/// Marks the tab dead on the first crash event, or when the event stream
/// ends because the tab's session is gone.
async fn watch_for_crash<S>(mut events: S, id: usize, liveness: Arc<TabLiveness>)
where
    S: Stream<Item = String> + Unpin,
{
    let reason = events
        .next()
        .await
        .unwrap_or_else(|| "target session ended".to_string());
    warn!("Rendering context {} is gone: {}", id, reason);
    liveness.mark_crashed();
}

/// In-flight request bookkeeping for [`WaitCondition::NetworkIdle`].
#[derive(Debug)]
struct NetworkIdleTracker {
    in_flight: HashSet<String>,
    quiet: Duration,
    last_activity: Instant,
}

impl NetworkIdleTracker {
    fn new(quiet: Duration, now: Instant) -> Self {
        Self {
            in_flight: HashSet::new(),
            quiet,
            last_activity: now,
        }
    }

    fn request_started(&mut self, request_id: String, now: Instant) {
        self.in_flight.insert(request_id);
        self.last_activity = now;
    }

    fn request_settled(&mut self, request_id: &str, now: Instant) {
        if self.in_flight.remove(request_id) {
            self.last_activity = now;
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.in_flight.is_empty() && now.duration_since(self.last_activity) >= self.quiet
    }

    /// How long to wait before idleness can next be decided.
    fn next_check(&self, now: Instant) -> Duration {
        if self.in_flight.is_empty() {
            self.quiet
                .saturating_sub(now.duration_since(self.last_activity))
                .max(Duration::from_millis(1))
        } else {
            self.quiet
        }
    }
}

pub struct ChromeContext {
    id: usize,
    page: Page,
    liveness: Arc<TabLiveness>,
    crash_watch: JoinHandle<()>,
}

impl ChromeContext {
    async fn wait_for_network_idle(&self, url: &str, quiet: Duration) -> Result<(), ScreenshotError> {
        let listen_failed = |e: chromiumoxide::error::CdpError| ScreenshotError::NavigationFailed(e.to_string());

        self.page
            .execute(NetworkEnableParams::default())
            .await
            .map_err(listen_failed)?;
        let mut started = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(listen_failed)?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(listen_failed)?;
        let mut failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(listen_failed)?;

        self.page
            .goto(url)
            .await
            .map_err(|e| ScreenshotError::NavigationFailed(e.to_string()))?;

        let mut tracker = NetworkIdleTracker::new(quiet, Instant::now());
        while !tracker.is_idle(Instant::now()) {
            let wait = tracker.next_check(Instant::now());
            tokio::select! {
                Some(event) = started.next() => {
                    tracker.request_started(event.request_id.inner().clone(), Instant::now());
                }
                Some(event) = finished.next() => {
                    tracker.request_settled(event.request_id.inner(), Instant::now());
                }
                Some(event) = failed.next() => {
                    tracker.request_settled(event.request_id.inner(), Instant::now());
                }
                _ = sleep(wait) => {}
            }
        }

        Ok(())
    }
}

impl Drop for ChromeContext {
    fn drop(&mut self) {
        self.crash_watch.abort();
    }
}

#[async_trait]
impl RenderContext for ChromeContext {
    fn id(&self) -> usize {
        self.id
    }

    async fn subscribe(&self, collector: SignalCollector) -> Result<Subscription, ScreenshotError> {
        self.page
            .execute(RuntimeEnableParams::default())
            .await
            .map_err(|e| ScreenshotError::ObserverFailed(e.to_string()))?;
        self.page
            .execute(NetworkEnableParams::default())
            .await
            .map_err(|e| ScreenshotError::ObserverFailed(e.to_string()))?;

        let mut console_events = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(|e| ScreenshotError::ObserverFailed(e.to_string()))?;
        let mut failure_events = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| ScreenshotError::ObserverFailed(e.to_string()))?;

        // The handler pushes events into these streams before it resolves
        // the navigation, so draining after `navigate` sees all of them.
        let console_collector = collector.clone();
        Ok(Subscription::new()
            .with_drain(move || {
                while let Some(Some(event)) = console_events.next().now_or_never() {
                    if event.r#type == ConsoleApiCalledType::Error {
                        console_collector.record_console_error(console_error_from_event(&event));
                    }
                }
            })
            .with_drain(move || {
                while let Some(Some(event)) = failure_events.next().now_or_never() {
                    collector.record_request_failure(event.error_text.clone());
                }
            }))
    }

    async fn navigate(&self, url: &str, wait_until: WaitCondition) -> Result<(), ScreenshotError> {
        match wait_until {
            WaitCondition::Load => {
                self.page
                    .goto(url)
                    .await
                    .map_err(|e| ScreenshotError::NavigationFailed(e.to_string()))?;
                Ok(())
            }
            WaitCondition::NetworkIdle { quiet_ms } => {
                self.wait_for_network_idle(url, Duration::from_millis(quiet_ms))
                    .await
            }
        }
    }

    async fn capture(&self, full_page: bool) -> Result<Vec<u8>, ScreenshotError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();

        self.page
            .screenshot(params)
            .await
            .map_err(|e| ScreenshotError::CaptureFailed(e.to_string()))
    }

    async fn set_content(&self, html: &str) -> Result<(), ScreenshotError> {
        self.page
            .set_content(html)
            .await
            .map_err(|e| ScreenshotError::ContentFailed(e.to_string()))?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), ScreenshotError> {
        self.page
            .execute(StopLoadingParams::default())
            .await
            .map_err(|e| ScreenshotError::NavigationFailed(e.to_string()))?;
        self.page
            .goto("about:blank")
            .await
            .map_err(|e| ScreenshotError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        if !self.liveness.mark_closed() {
            return;
        }
        self.crash_watch.abort();
        if let Err(e) = self.page.clone().close().await {
            debug!("Closing rendering context {} failed: {}", self.id, e);
        }
    }

    fn is_live(&self) -> bool {
        self.liveness.is_live()
    }
}

fn console_error_from_event(event: &EventConsoleApiCalled) -> ConsoleError {
    let text = event
        .args
        .iter()
        .filter_map(remote_object_text)
        .collect::<Vec<_>>()
        .join(" ");

    let frame = event
        .stack_trace
        .as_ref()
        .and_then(|trace| trace.call_frames.first());

    ConsoleError {
        text,
        url: frame.map(|f| f.url.clone()).unwrap_or_default(),
        line: frame.map(|f| f.line_number).unwrap_or_default(),
        column: frame.map(|f| f.column_number).unwrap_or_default(),
    }
}

fn remote_object_text(object: &RemoteObject) -> Option<String> {
    match &object.value {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(value) => Some(value.to_string()),
        None => object.description.clone(),
    }
}
