use std::time::Duration;
use thiserror::Error;

/// Chromium's conventional prefix for network-layer error codes.
pub const NETWORK_ERROR_PREFIX: &str = "net::ERR_";

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("Missing URL parameter")]
    MissingUrl,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Rendering context creation failed: {0}")]
    ContextCreationFailed(String),

    #[error("{0}")]
    NavigationFailed(String),

    #[error("Navigation timeout of {} ms exceeded", .0.as_millis())]
    NavigationTimeout(Duration),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Setting page content failed: {0}")]
    ContentFailed(String),

    #[error("Attaching page observers failed: {0}")]
    ObserverFailed(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Capture task ended without a response")]
    RequestDropped,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ScreenshotError {
    /// Network-class navigation failures carry a `net::ERR_*` code somewhere in
    /// their message.
    pub fn is_network_error(&self) -> bool {
        match self {
            ScreenshotError::NavigationFailed(message) => message.contains(NETWORK_ERROR_PREFIX),
            _ => false,
        }
    }

    /// True for failures of the navigation step, which become error artifacts
    /// instead of failed requests.
    pub fn is_navigation_failure(&self) -> bool {
        matches!(
            self,
            ScreenshotError::NavigationFailed(_) | ScreenshotError::NavigationTimeout(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScreenshotError::MissingUrl => ErrorSeverity::Low,
            ScreenshotError::NavigationFailed(_) => ErrorSeverity::Low,
            ScreenshotError::NavigationTimeout(_) => ErrorSeverity::Low,
            ScreenshotError::ShuttingDown => ErrorSeverity::Low,
            ScreenshotError::ConfigurationError(_) => ErrorSeverity::High,
            ScreenshotError::BrowserLaunchFailed(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        ScreenshotError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_detection() {
        let err = ScreenshotError::NavigationFailed(
            "net::ERR_NAME_NOT_RESOLVED at https://nope.invalid".to_string(),
        );
        assert!(err.is_network_error());

        let err = ScreenshotError::NavigationFailed("Cannot navigate to invalid URL".to_string());
        assert!(!err.is_network_error());

        assert!(!ScreenshotError::NavigationTimeout(Duration::from_secs(1)).is_network_error());
        assert!(!ScreenshotError::CaptureFailed("net::ERR_ABORTED".to_string()).is_network_error());
    }

    #[test]
    fn test_navigation_failure_classes() {
        assert!(ScreenshotError::NavigationTimeout(Duration::from_millis(5)).is_navigation_failure());
        assert!(ScreenshotError::NavigationFailed("boom".to_string()).is_navigation_failure());
        assert!(!ScreenshotError::CaptureFailed("boom".to_string()).is_navigation_failure());
        assert!(!ScreenshotError::MissingUrl.is_navigation_failure());
    }

    #[test]
    fn test_timeout_message() {
        let err = ScreenshotError::NavigationTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Navigation timeout of 1500 ms exceeded");
        assert_eq!(ScreenshotError::MissingUrl.to_string(), "Missing URL parameter");
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ScreenshotError::MissingUrl.severity(), ErrorSeverity::Low);
        assert_eq!(
            ScreenshotError::CaptureFailed("x".to_string()).severity(),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ScreenshotError::ConfigurationError("x".to_string()).severity(),
            ErrorSeverity::High
        );
        assert_eq!(
            ScreenshotError::BrowserLaunchFailed("x".to_string()).severity(),
            ErrorSeverity::Critical
        );
    }
}
