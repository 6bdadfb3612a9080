use axum::{
    extract::{ConnectInfo, Request, State},
    http::header::RETRY_AFTER,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{FilterConfig, FilterSettings};
use crate::error::ConfigError;
use crate::rate_limit::{BucketCounter, Clock, SystemClock};

pub type ClientKey = String;

// Maps a request to the identity its quota is charged to
pub type KeyStrategy = Arc<dyn Fn(&Request) -> ClientKey + Send + Sync>;

// Called after every admission decision
pub type DecisionHook = Arc<dyn Fn(&Decision) + Send + Sync>;

const UNKNOWN_CLIENT: &str = "unknown";

/// Count of the forwarded request within its client's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCount(pub u32);

/// Outcome of charging one request to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub key: ClientKey,
    pub count: u32,
    pub limit: u32,
    /// Within quota.
    pub admitted: bool,
    /// Downstream handler runs (admitted, or over quota while not enforcing).
    pub forwarded: bool,
    pub retry_after: Duration,
}

// Peer address as recorded by `into_make_service_with_connect_info`
pub fn remote_addr(req: &Request) -> ClientKey {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

// Leftmost X-Forwarded-For hop, then X-Real-IP, then the peer address.
// Only safe behind a proxy that overwrites these headers.
pub fn forwarded_for(req: &Request) -> ClientKey {
    header_value(req, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_value(req, "x-real-ip"))
        .map(str::to_string)
        .unwrap_or_else(|| remote_addr(req))
}

fn header_value<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Per-client admission control for an axum router.
///
/// Owns its own [`BucketCounter`]; independently configured filters in one
/// process never share counts.
pub struct AdmissionFilter {
    settings: FilterSettings,
    counter: Arc<BucketCounter>,
    key_strategy: KeyStrategy,
    hook: Option<DecisionHook>,
    maintenance: Option<JoinHandle<()>>,
}

impl AdmissionFilter {
    pub fn configure(config: &FilterConfig) -> Result<Self, ConfigError> {
        Self::configure_with_clock(config, Arc::new(SystemClock))
    }

    pub fn configure_with_clock(config: &FilterConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let settings = config.validate()?;

        let counter = Arc::new(BucketCounter::with_clock(settings.window_seconds, clock));
        let key_strategy: KeyStrategy = if settings.trust_proxy {
            Arc::new(forwarded_for)
        } else {
            Arc::new(remote_addr)
        };

        tracing::info!(
            window_seconds = settings.window_seconds.get(),
            request_limit = settings.request_limit.get(),
            enforce = settings.enforce,
            trust_proxy = settings.trust_proxy,
            "admission filter configured"
        );

        Ok(Self {
            settings,
            counter,
            key_strategy,
            hook: None,
            maintenance: None,
        })
    }

    pub fn with_key_strategy<F>(mut self, strategy: F) -> Self
    where
        F: Fn(&Request) -> ClientKey + Send + Sync + 'static,
    {
        self.key_strategy = Arc::new(strategy);
        self
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Decision) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Starts the idle-client sweep. Needs a tokio runtime; stopped when the
    /// filter is dropped.
    pub fn start_maintenance(&mut self) {
        if self.maintenance.is_none() {
            let handle = self.counter.spawn_maintenance(self.settings.idle_windows.get());
            self.maintenance = Some(handle);
        }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    pub fn counter(&self) -> &BucketCounter {
        &self.counter
    }

    /// Charges `req` to its client and decides whether it may proceed.
    pub fn decide(&self, req: &Request) -> Decision {
        let key = (self.key_strategy)(req);
        let limit = self.settings.request_limit.get();

        let now = self.counter.now();
        let (count, admitted) = self.counter.admit_at(&key, limit, now);

        let decision = Decision {
            forwarded: admitted || !self.settings.enforce,
            retry_after: Duration::from_millis(self.counter.millis_until_next_window(now)),
            key,
            count,
            limit,
            admitted,
        };

        if !admitted {
            if decision.forwarded {
                tracing::info!(client = %decision.key, count, limit, "quota exceeded, not enforcing");
            } else {
                tracing::debug!(client = %decision.key, count, limit, "request rejected");
            }
        }

        if let Some(hook) = &self.hook {
            hook(&decision);
        }

        decision
    }

    fn reject(&self, decision: &Decision) -> Response {
        // whole seconds, rounded up
        let retry_secs = decision.retry_after.as_millis().div_ceil(1000);

        (
            self.settings.status_code,
            [(RETRY_AFTER, retry_secs.to_string())],
            self.settings.status_message.clone(),
        )
            .into_response()
    }
}

impl Drop for AdmissionFilter {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
    }
}

/// axum middleware: forwards admitted requests, answers the rest directly.
///
/// Install with `middleware::from_fn_with_state(filter, handle)`.
pub async fn handle(State(filter): State<Arc<AdmissionFilter>>, mut req: Request, next: Next) -> Response {
    let decision = filter.decide(&req);

    if !decision.forwarded {
        return filter.reject(&decision);
    }

    req.extensions_mut().insert(RequestCount(decision.count));
    next.run(req).await
}
