use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, TextEncoder, register_counter};

use crate::filter::Decision;

lazy_static! {
    pub static ref REQUESTS_TOTAL: Counter =
        register_counter!("admission_requests_total", "Total number of requests seen by the filter")
            .expect("admission_requests_total registers once");
    pub static ref REQUESTS_ADMITTED: Counter =
        register_counter!("admission_admitted_total", "Requests within their client's quota")
            .expect("admission_admitted_total registers once");
    pub static ref REQUESTS_REJECTED: Counter =
        register_counter!("admission_rejected_total", "Requests over their client's quota")
            .expect("admission_rejected_total registers once");
}

// Decision hook for the admission filter
pub fn record_decision(decision: &Decision) {
    REQUESTS_TOTAL.inc();
    if decision.admitted {
        REQUESTS_ADMITTED.inc();
    } else {
        REQUESTS_REJECTED.inc();
    }
}

// Prometheus text exposition of the default registry
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Encode error: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Encode error: {}", e))
}
