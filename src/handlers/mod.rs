mod accepted;
mod health;
mod metrics;

pub use accepted::accepted_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
