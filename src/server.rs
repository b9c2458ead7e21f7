//! HTTP binding
//!
//! `GET /screenshot?url=<target>` answers 200 with the base64-encoded
//! artifact whenever a URL is given, including when the page failed to load;
//! the failure is visible in the image. Only a missing URL is a client error.

use crate::{
    assess, extract_host, CaptureRequest, Dispatcher, ErrorSeverity, HealthThresholds,
    ScreenshotError,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub metrics: Option<PrometheusHandle>,
    pub thresholds: Arc<HealthThresholds>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            metrics: None,
            thresholds: Arc::new(HealthThresholds::default()),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotQuery {
    pub url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/screenshot", get(screenshot))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<(), ScreenshotError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Screenshot service running on port {}", port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn screenshot(
    State(state): State<AppState>,
    Query(query): Query<ScreenshotQuery>,
) -> Result<String, ScreenshotError> {
    let url = query
        .url
        .filter(|url| !url.is_empty())
        .ok_or(ScreenshotError::MissingUrl)?;

    debug!(
        "Screenshot requested for {} (host: {:?})",
        url,
        extract_host(&url)
    );

    let artifact = state.dispatcher.handle(CaptureRequest::new(url)).await?;
    Ok(BASE64_STANDARD.encode(&artifact.bytes))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(assess(state.dispatcher.stats(), &state.thresholds))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics are disabled").into_response(),
    }
}

impl IntoResponse for ScreenshotError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScreenshotError::MissingUrl => StatusCode::BAD_REQUEST,
            ScreenshotError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match self.severity() {
            ErrorSeverity::Low => debug!("Request failed: {}", self),
            ErrorSeverity::Medium => warn!("Request failed: {}", self),
            ErrorSeverity::High | ErrorSeverity::Critical => error!("Request failed: {}", self),
        }

        (status, self.to_string()).into_response()
    }
}
