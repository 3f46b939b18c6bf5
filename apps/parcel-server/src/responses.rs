use axum::{
    body::Body,
    http::{
        header::{ACCEPT_RANGES, CACHE_CONTROL, CONTENT_RANGE},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// JSON error body `{"error": code}` used by every failing request.
pub(crate) fn error_response(status: StatusCode, code: &'static str) -> Response {
    let mut resp = (status, Json(json!({ "error": code }))).into_response();
    let headers = resp.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

pub(crate) fn range_not_satisfiable(len: u64) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(ACCEPT_RANGES, "bytes")
        .header(CACHE_CONTROL, "no-store");
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
        builder = builder.header(CONTENT_RANGE, value);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
