//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the screenshot server,
//! including pool sizing, navigation policy, viewport and browser launch settings.

use crate::ScreenshotError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port used when neither `--port` nor `PORT` is given.
pub const DEFAULT_PORT: u16 = 3000;

/// Main configuration structure for the screenshot server
///
/// Controls the size of the rendering-context pool, how navigation is bounded,
/// and how the browser is launched.
///
/// # Examples
///
/// ```rust
/// use screenshot_server::{Config, NavigationTimeout};
/// use std::time::Duration;
///
/// let config = Config {
///     pool_size: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.navigation.timeout, NavigationTimeout::Fixed(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of rendering contexts created at startup (default: CPU count, at most 4)
    ///
    /// This is the hard upper bound on concurrent captures. Requests arriving
    /// while every context is busy wait in the admission queue.
    pub pool_size: usize,

    /// Listening port for the HTTP binding (default: 3000)
    pub port: u16,

    /// Viewport applied to every rendering context
    pub viewport: Viewport,

    /// How navigation to the target URL is awaited and bounded
    pub navigation: NavigationPolicy,

    /// Capture the whole scrollable page instead of the viewport (default: false)
    pub full_page: bool,

    /// Append the raw engine message to "Network error" artifacts (default: false)
    pub debug_traces: bool,

    /// Create a fresh context when a dead one is discarded on release (default: true)
    ///
    /// When disabled, every discarded context permanently shrinks the pool.
    pub replace_discarded_contexts: bool,

    /// Expose Prometheus metrics on `/metrics` (default: false)
    pub enable_metrics: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for requests (default: Chrome default)
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().clamp(1, 4),
            port: DEFAULT_PORT,
            viewport: Viewport::default(),
            navigation: NavigationPolicy::default(),
            full_page: false,
            debug_traces: false,
            replace_discarded_contexts: true,
            enable_metrics: false,
            chrome_path: None,
            user_agent: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ScreenshotError> {
        if self.pool_size == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ScreenshotError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.navigation.timeout == NavigationTimeout::Fixed(Duration::ZERO) {
            return Err(ScreenshotError::ConfigurationError(
                "A fixed navigation timeout must be greater than 0; use `disabled` for no timeout"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Browser viewport configuration for screenshots
///
/// # Examples
///
/// ```rust
/// use screenshot_server::Viewport;
///
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.mobile);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Upper bound on a single navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationTimeout {
    Fixed(Duration),
    /// Navigation may take as long as the page needs.
    Disabled,
}

impl NavigationTimeout {
    /// `0` means no timeout, matching the CLI's `--nav-timeout-ms 0`.
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            NavigationTimeout::Disabled
        } else {
            NavigationTimeout::Fixed(Duration::from_millis(millis))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            NavigationTimeout::Fixed(duration) => Some(*duration),
            NavigationTimeout::Disabled => None,
        }
    }
}

/// Event that marks a navigation as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    /// The page's `load` event fired.
    #[default]
    Load,
    /// `load` fired and no network request has been in flight for
    /// `quiet_ms` milliseconds.
    NetworkIdle { quiet_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NavigationPolicy {
    pub wait_until: WaitCondition,
    pub timeout: NavigationTimeout,
}

impl Default for NavigationPolicy {
    fn default() -> Self {
        Self {
            wait_until: WaitCondition::Load,
            timeout: NavigationTimeout::Fixed(Duration::from_secs(30)),
        }
    }
}

/// A single inbound capture, keyed by its target URL.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub id: String,
    pub url: String,
    pub full_page: bool,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: String::new(),
            full_page: false,
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// Sandboxing, GPU and shared-memory usage are disabled and the browser runs
/// in single-process mode, which keeps one pooled browser cheap enough to run
/// inside a container.
///
/// # Examples
///
/// ```rust
/// use screenshot_server::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--single-process".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--single-process".to_string(),
        "--no-zygote".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!(
            "--user-data-dir=/tmp/screenshot-server-{}",
            std::process::id()
        ),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, ScreenshotError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(ScreenshotError::BrowserLaunchFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!((1..=4).contains(&config.pool_size));
        assert_eq!(config.port, 3000);
        assert!(!config.full_page);
        assert!(config.replace_discarded_contexts);
        assert_eq!(config.navigation.wait_until, WaitCondition::Load);
        assert_eq!(
            config.navigation.timeout,
            NavigationTimeout::Fixed(Duration::from_secs(30))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"pool_size": 2, "navigation": {"timeout": "disabled"}}"#)
                .unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.navigation.timeout, NavigationTimeout::Disabled);
        assert_eq!(config.viewport, Viewport::default());
    }

    #[test]
    fn test_config_validation() {
        let config = Config {
            pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ScreenshotError::ConfigurationError(_))
        ));

        let mut config = Config::default();
        config.viewport.height = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.navigation.timeout = NavigationTimeout::Fixed(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_idle_from_json() {
        let policy: NavigationPolicy =
            serde_json::from_str(r#"{"wait_until": {"network_idle": {"quiet_ms": 250}}}"#)
                .unwrap();
        assert_eq!(policy.wait_until, WaitCondition::NetworkIdle { quiet_ms: 250 });
        assert_eq!(
            policy.timeout,
            NavigationTimeout::Fixed(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_navigation_timeout_from_millis() {
        assert_eq!(NavigationTimeout::from_millis(0), NavigationTimeout::Disabled);
        assert_eq!(
            NavigationTimeout::from_millis(250),
            NavigationTimeout::Fixed(Duration::from_millis(250))
        );
        assert_eq!(NavigationTimeout::Disabled.as_duration(), None);
    }

    #[test]
    fn test_capture_request_default() {
        let request = CaptureRequest::new("https://example.com");
        assert!(!request.id.is_empty());
        assert_eq!(request.url, "https://example.com");
        assert!(!request.full_page);
        assert_ne!(request.id, CaptureRequest::default().id);
    }

    #[test]
    fn test_chrome_args_generation() {
        let config = Config {
            user_agent: Some("capture-bot/1.0".to_string()),
            ..Default::default()
        };
        let args = get_chrome_args(&config);

        for flag in [
            "--no-sandbox",
            "--disable-gpu",
            "--disable-dev-shm-usage",
            "--single-process",
        ] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        assert!(args.contains(&format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        )));
        assert!(args.contains(&"--user-agent=capture-bot/1.0".to_string()));
    }
}
