use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// Health probe.
pub(crate) async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}
