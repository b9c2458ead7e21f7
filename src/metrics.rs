//! Capture and pool metrics
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed. [`install_prometheus`] installs the Prometheus
//! exporter whose handle backs the `/metrics` endpoint.

use crate::ScreenshotError;
use metrics::{gauge, histogram, increment_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub const CAPTURES_TOTAL: &str = "screenshot_captures_total";
pub const CAPTURE_ERRORS_TOTAL: &str = "screenshot_capture_errors_total";
pub const CAPTURE_DURATION_SECONDS: &str = "screenshot_capture_duration_seconds";
pub const QUEUE_DEPTH: &str = "screenshot_queue_depth";
pub const IDLE_CONTEXTS: &str = "screenshot_idle_contexts";
pub const CONTEXTS_DISCARDED_TOTAL: &str = "screenshot_contexts_discarded_total";
pub const CONTEXTS_REPLACED_TOTAL: &str = "screenshot_contexts_replaced_total";

pub fn install_prometheus() -> Result<PrometheusHandle, ScreenshotError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ScreenshotError::ConfigurationError(e.to_string()))?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

pub fn record_capture(outcome: &'static str, duration: Duration) {
    increment_counter!(CAPTURES_TOTAL, "outcome" => outcome);
    histogram!(CAPTURE_DURATION_SECONDS, duration.as_secs_f64());
}

pub fn record_capture_error(error: &ScreenshotError) {
    let kind = match error {
        ScreenshotError::CaptureFailed(_) => "capture",
        ScreenshotError::ContentFailed(_) => "content",
        ScreenshotError::ContextCreationFailed(_) => "context",
        ScreenshotError::ObserverFailed(_) => "observer",
        _ => "other",
    };
    increment_counter!(CAPTURE_ERRORS_TOTAL, "kind" => kind);
}

pub fn set_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH, depth as f64);
}

pub fn set_idle_contexts(idle: usize) {
    gauge!(IDLE_CONTEXTS, idle as f64);
}

pub fn record_context_discarded() {
    increment_counter!(CONTEXTS_DISCARDED_TOTAL);
}

pub fn record_context_replaced() {
    increment_counter!(CONTEXTS_REPLACED_TOTAL);
}
