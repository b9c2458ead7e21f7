//! Per-request capture pipeline
//!
//! A capture walks `Acquiring → Observing → Classifying → RenderingArtifact →
//! Releasing → Done`. The context arrives already acquired, wrapped in a
//! [`ContextLease`]; the lease is dropped on every way out of [`CapturePipeline::run`],
//! which is what returns the context to the pool. Page problems never fail
//! the request: they are drawn into the artifact instead.

use crate::{
    escape_html, format_duration, metrics, CaptureRequest, CaptureResponse, Config, ConsoleError,
    ContextLease, NavigationPolicy, NavigationTimeout, PageSignals, RenderContext, RenderEngine,
    ScreenshotError, SignalCollector, Viewport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, warn};

const RESET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    Acquiring,
    Observing,
    Classifying,
    RenderingArtifact,
    Releasing,
    Done,
}

/// How a capture attempt ended. Exactly one applies per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The page loaded cleanly; the artifact is the live page.
    Success,
    /// Navigation threw; `reason` is the normalized failure text.
    NavigationFailure { reason: String },
    /// The page loaded but reported problems. Console errors take priority:
    /// when any were seen, `failed_request` is left empty.
    PageErrorSignals {
        console_errors: Vec<ConsoleError>,
        failed_request: Option<String>,
    },
}

impl CaptureOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CaptureOutcome::Success => "success",
            CaptureOutcome::NavigationFailure { .. } => "navigation_failure",
            CaptureOutcome::PageErrorSignals { .. } => "page_errors",
        }
    }

    /// Human-readable lines drawn into an error artifact.
    pub fn signal_lines(&self) -> Vec<String> {
        match self {
            CaptureOutcome::Success => Vec::new(),
            CaptureOutcome::NavigationFailure { reason } => {
                reason.lines().map(str::to_string).collect()
            }
            CaptureOutcome::PageErrorSignals {
                console_errors,
                failed_request,
            } => console_errors
                .iter()
                .map(ToString::to_string)
                .chain(failed_request.iter().cloned())
                .collect(),
        }
    }
}

/// The image handed back to the caller.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub request_id: String,
    pub url: String,
    pub bytes: Vec<u8>,
    pub outcome: CaptureOutcome,
    pub context_id: usize,
    pub duration: Duration,
}

/// Turns the result of navigation plus whatever the observers saw into an
/// outcome.
pub fn classify(
    navigation: Result<(), ScreenshotError>,
    signals: PageSignals,
    debug_traces: bool,
) -> CaptureOutcome {
    if let Err(err) = navigation {
        return CaptureOutcome::NavigationFailure {
            reason: failure_reason(&err, debug_traces),
        };
    }

    if !signals.console_errors.is_empty() {
        CaptureOutcome::PageErrorSignals {
            console_errors: signals.console_errors,
            failed_request: None,
        }
    } else if let Some(failed) = signals.failed_request {
        CaptureOutcome::PageErrorSignals {
            console_errors: Vec::new(),
            failed_request: Some(failed),
        }
    } else {
        CaptureOutcome::Success
    }
}

/// Network-class errors collapse to "Network error"; everything else keeps
/// its own message.
pub fn failure_reason(err: &ScreenshotError, debug_traces: bool) -> String {
    if err.is_network_error() {
        if debug_traces {
            format!("Network error\n{err}")
        } else {
            "Network error".to_string()
        }
    } else {
        err.to_string()
    }
}

pub fn page_errors_html(lines: &[String]) -> String {
    error_page("Page errors", lines)
}

pub fn navigation_failure_html(lines: &[String]) -> String {
    error_page("Navigation failed", lines)
}

fn error_page(title: &str, lines: &[String]) -> String {
    let body = lines
        .iter()
        .map(|line| escape_html(line))
        .collect::<Vec<_>>()
        .join("<br>");

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family: sans-serif; padding: 2em;\">\
         <h1 style=\"color: #b00020;\">{title}</h1><p>{body}</p></body></html>"
    )
}

#[derive(Clone)]
pub struct CapturePipeline {
    engine: Arc<dyn RenderEngine>,
    navigation: NavigationPolicy,
    viewport: Viewport,
    full_page: bool,
    debug_traces: bool,
}

impl CapturePipeline {
    pub fn new(engine: Arc<dyn RenderEngine>, config: &Config) -> Self {
        Self {
            engine,
            navigation: config.navigation.clone(),
            viewport: config.viewport.clone(),
            full_page: config.full_page,
            debug_traces: config.debug_traces,
        }
    }

    pub fn engine(&self) -> &Arc<dyn RenderEngine> {
        &self.engine
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub async fn run(&self, lease: ContextLease, request: &CaptureRequest) -> CaptureResponse {
        let start_time = Instant::now();
        let context_id = lease.context().id();
        trace_stage(request, CaptureStage::Acquiring);

        let rendered = self.capture_on(lease.context(), request).await;

        trace_stage(request, CaptureStage::Releasing);
        drop(lease);

        let (outcome, bytes) = match rendered {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(
                    "Capture {} for {} failed after {}: {}",
                    request.id,
                    request.url,
                    format_duration(start_time.elapsed()),
                    e
                );
                metrics::record_capture_error(&e);
                return Err(e);
            }
        };

        let duration = start_time.elapsed();
        metrics::record_capture(outcome.label(), duration);
        trace_stage(request, CaptureStage::Done);
        debug!(
            "Capture {} for {} finished as {} in {} ({} bytes)",
            request.id,
            request.url,
            outcome.label(),
            format_duration(duration),
            bytes.len()
        );

        Ok(Artifact {
            request_id: request.id.clone(),
            url: request.url.clone(),
            bytes,
            outcome,
            context_id,
            duration,
        })
    }

    async fn capture_on(
        &self,
        context: &dyn RenderContext,
        request: &CaptureRequest,
    ) -> Result<(CaptureOutcome, Vec<u8>), ScreenshotError> {
        trace_stage(request, CaptureStage::Observing);
        let collector = SignalCollector::new();
        let navigation = {
            let mut subscription = context.subscribe(collector.clone()).await?;
            let navigation = self.navigate(context, &request.url).await;
            subscription.drain();
            navigation
        };

        trace_stage(request, CaptureStage::Classifying);
        let outcome = classify(navigation, collector.snapshot(), self.debug_traces);

        trace_stage(request, CaptureStage::RenderingArtifact);
        let bytes = match &outcome {
            CaptureOutcome::Success => context.capture(request.full_page || self.full_page).await?,
            CaptureOutcome::PageErrorSignals { .. } => {
                warn!(
                    "Page errors while capturing {}: {}",
                    request.url,
                    outcome.signal_lines().join("; ")
                );
                context
                    .set_content(&page_errors_html(&outcome.signal_lines()))
                    .await?;
                context.capture(false).await?
            }
            CaptureOutcome::NavigationFailure { reason } => {
                warn!("Navigation to {} failed: {}", request.url, reason);
                self.reset_after_failure(context).await;
                self.render_on_scratch(&navigation_failure_html(&outcome.signal_lines()))
                    .await?
            }
        };

        Ok((outcome, bytes))
    }

    async fn navigate(&self, context: &dyn RenderContext, url: &str) -> Result<(), ScreenshotError> {
        let navigation = context.navigate(url, self.navigation.wait_until);

        match self.navigation.timeout {
            NavigationTimeout::Fixed(limit) => timeout(limit, navigation)
                .await
                .unwrap_or(Err(ScreenshotError::NavigationTimeout(limit))),
            NavigationTimeout::Disabled => navigation.await,
        }
    }

    /// Stops the abandoned navigation before the context goes back to the
    /// pool. A context that cannot be reset is closed, so release discards it.
    async fn reset_after_failure(&self, context: &dyn RenderContext) {
        let failure = match timeout(RESET_TIMEOUT, context.reset()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response within {}", format_duration(RESET_TIMEOUT)),
        };

        warn!(
            "Could not reset rendering context {} after a failed navigation: {}",
            context.id(),
            failure
        );
        context.close().await;
    }

    /// The failed context is mid-navigation, so the error page is drawn on a
    /// throwaway context that is closed whatever happens.
    async fn render_on_scratch(&self, html: &str) -> Result<Vec<u8>, ScreenshotError> {
        let scratch = self.engine.new_context(&self.viewport).await?;

        let result = match scratch.set_content(html).await {
            Ok(()) => scratch.capture(false).await,
            Err(e) => Err(e),
        };

        scratch.close().await;
        result
    }
}

fn trace_stage(request: &CaptureRequest, stage: CaptureStage) {
    tracing::trace!("Capture {} entering {:?}", request.id, stage);
}
