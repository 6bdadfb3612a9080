use axum::http::StatusCode;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroU64};

use crate::error::ConfigError;
use crate::rate_limit::MAX_LIMIT;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "admission-gate")]
#[command(about = "HTTP gateway enforcing per-client fixed-window request quotas")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Max admitted requests per client per window
    #[arg(long, default_value_t = default_request_limit(), allow_negative_numbers = true)]
    pub request_limit: i64,

    // Window length in seconds
    #[arg(long, default_value_t = default_window_seconds(), allow_negative_numbers = true)]
    pub window_seconds: i64,

    // Reject over-limit requests (false = log only)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enforce: bool,

    // Status code of the rejection response
    #[arg(long, default_value_t = default_status_code())]
    pub status_code: u16,

    // Body of the rejection response
    #[arg(long, default_value_t = default_status_message())]
    pub status_message: String,

    // Key clients by X-Forwarded-For / X-Real-IP (only behind a trusted proxy)
    #[arg(long)]
    pub trust_proxy: bool,

    // Windows of inactivity before a client's counter is evicted
    #[arg(long, default_value_t = default_idle_windows())]
    pub idle_windows: u32,

    // Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            window_seconds: self.window_seconds,
            request_limit: self.request_limit,
            enforce: self.enforce,
            status_code: self.status_code,
            status_message: self.status_message.clone(),
            trust_proxy: self.trust_proxy,
            idle_windows: self.idle_windows,
        }
    }
}

/// Raw filter configuration as supplied by the host.
///
/// Numeric fields are signed so that negative values reach [`validate`]
/// and are reported as a [`ConfigError`].
///
/// [`validate`]: FilterConfig::validate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilterConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,

    #[serde(default = "default_request_limit")]
    pub request_limit: i64,

    #[serde(default = "default_enforce")]
    pub enforce: bool,

    #[serde(default = "default_status_code")]
    pub status_code: u16,

    #[serde(default = "default_status_message")]
    pub status_message: String,

    #[serde(default)]
    pub trust_proxy: bool,

    #[serde(default = "default_idle_windows")]
    pub idle_windows: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            request_limit: default_request_limit(),
            enforce: default_enforce(),
            status_code: default_status_code(),
            status_message: default_status_message(),
            trust_proxy: false,
            idle_windows: default_idle_windows(),
        }
    }
}

impl FilterConfig {
    pub fn new(window_seconds: i64, request_limit: i64) -> Self {
        Self {
            window_seconds,
            request_limit,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<FilterSettings, ConfigError> {
        let window_seconds = u64::try_from(self.window_seconds)
            .ok()
            .and_then(NonZeroU64::new)
            .ok_or(ConfigError::NonPositiveWindow(self.window_seconds))?;

        if self.request_limit <= 0 {
            return Err(ConfigError::NonPositiveLimit(self.request_limit));
        }
        let request_limit = u32::try_from(self.request_limit)
            .ok()
            .filter(|limit| *limit <= MAX_LIMIT)
            .and_then(NonZeroU32::new)
            .ok_or(ConfigError::LimitTooLarge(self.request_limit))?;

        let status_code = StatusCode::from_u16(self.status_code)
            .ok()
            .filter(|s| s.is_client_error() || s.is_server_error())
            .ok_or(ConfigError::InvalidStatusCode(self.status_code))?;

        let idle_windows = NonZeroU32::new(self.idle_windows).ok_or(ConfigError::ZeroIdleWindows)?;

        Ok(FilterSettings {
            window_seconds,
            request_limit,
            enforce: self.enforce,
            status_code,
            status_message: self.status_message.clone(),
            trust_proxy: self.trust_proxy,
            idle_windows,
        })
    }
}

/// Validated, immutable filter parameters.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub window_seconds: NonZeroU64,
    pub request_limit: NonZeroU32,
    pub enforce: bool,
    pub status_code: StatusCode,
    pub status_message: String,
    pub trust_proxy: bool,
    pub idle_windows: NonZeroU32,
}

fn default_window_seconds() -> i64 {
    60
}

fn default_request_limit() -> i64 {
    300
}

fn default_enforce() -> bool {
    true
}

fn default_status_code() -> u16 {
    429
}

fn default_status_message() -> String {
    "Too many requests".to_string()
}

fn default_idle_windows() -> u32 {
    2
}
