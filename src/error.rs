/// Errors raised while configuring the admission filter.
///
/// Only produced at startup; a running filter never fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("window_seconds must be positive, got {0}")]
    NonPositiveWindow(i64),

    #[error("request_limit must be positive, got {0}")]
    NonPositiveLimit(i64),

    #[error("request_limit {0} exceeds the maximum of {max}", max = crate::rate_limit::MAX_LIMIT)]
    LimitTooLarge(i64),

    /// Rejection status must be a client or server error.
    #[error("status_code {0} is not a 4xx or 5xx status")]
    InvalidStatusCode(u16),

    #[error("idle_windows must be at least 1")]
    ZeroIdleWindows,
}
