//! # Screenshot Server
//!
//! An HTTP service that renders web pages to PNG images on demand. A fixed
//! pool of headless Chrome tabs ("rendering contexts") is created at startup;
//! requests that arrive while every context is busy wait in a FIFO admission
//! queue and are handed a context the moment one is released.
//!
//! Page failures never become HTTP errors. A page that cannot be loaded, or
//! that logs console errors or fails a sub-request while loading, still
//! produces an image: a rendered error page naming what went wrong.
//!
//! ## Architecture
//!
//! | Module | Role |
//! |--------|------|
//! | [`pool`] | Idle rendering contexts, liveness-checked on release |
//! | [`queue`] | FIFO of requests waiting for a context |
//! | [`pipeline`] | Navigate, collect page signals, classify, render the artifact |
//! | [`dispatcher`] | Admission, hand-off on release, replacement of dead contexts |
//! | [`server`] | `GET /screenshot`, `GET /health`, `GET /metrics` |
//! | [`chrome`] | chromiumoxide-backed [`RenderEngine`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_server::{CaptureRequest, ChromeEngine, Config, Dispatcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let engine = Arc::new(ChromeEngine::launch(&config).await?);
//!     let dispatcher = Dispatcher::start(&config, engine).await?;
//!
//!     let artifact = dispatcher
//!         .handle(CaptureRequest::new("https://example.com"))
//!         .await?;
//!     println!("{}: {} bytes", artifact.outcome.label(), artifact.bytes.len());
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-server --port 3000 --pool-size 4
//! screenshot-server capture --url https://example.com --output example.png
//! screenshot-server validate --config server.json
//! ```

/// Configuration and engine launch settings
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Rendering engine abstraction and page signal collection
pub mod engine;

/// Headless Chrome implementation of the rendering engine
pub mod chrome;

/// Pool of idle rendering contexts
pub mod pool;

/// FIFO admission queue
pub mod queue;

/// Capture pipeline and artifact rendering
pub mod pipeline;

/// Request dispatch over the pool and queue
pub mod dispatcher;

/// HTTP binding
pub mod server;

/// Health assessment of the pool and queue
pub mod health;

/// Prometheus metrics
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;


pub use crate::metrics::install_prometheus;
pub use chrome::*;
pub use cli::*;
pub use config::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use health::*;
pub use pipeline::*;
pub use pool::*;
pub use queue::*;
pub use server::*;
pub use utils::*;
