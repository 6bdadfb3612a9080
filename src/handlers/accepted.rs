use axum::{Extension, Json, response::IntoResponse};

use crate::filter::RequestCount;

// Fallback for every route the gateway doesn't own; reports the request's
// position in its client's window.
pub async fn accepted_handler(count: Option<Extension<RequestCount>>) -> impl IntoResponse {
    let count = count.map(|Extension(RequestCount(n))| n);
    Json(serde_json::json!({
        "status": "ok",
        "count": count
    }))
}
