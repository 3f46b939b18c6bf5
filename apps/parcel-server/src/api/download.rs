use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{
    header::{
        ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
        CONTENT_TYPE, LAST_MODIFIED, RANGE, X_CONTENT_TYPE_OPTIONS,
    },
    HeaderMap, HeaderValue, Method, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use parcel_core::{resolve_range, ByteRange, DownloadToken, ResolvedRange, TokenState};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::assets::AssetMeta;
use crate::error::DownloadError;
use crate::leases::token_tag;
use crate::session::{SessionEnd, TrackedBody};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

impl TokenQuery {
    fn token(&self) -> Result<&str, DownloadError> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(DownloadError::NoToken)
    }
}

/// `GET|HEAD /download?token=`. HEAD reports headers without taking a lease.
pub(crate) async fn download(
    method: Method,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    match serve_download(&state, &method, &query, &headers).await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(code = err.code(), "download refused");
            err.into_response()
        }
    }
}

async fn serve_download(
    state: &AppState,
    method: &Method,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> Result<Response, DownloadError> {
    let token = query.token()?;
    let record = load_token(state, token).await?;
    if record.state == TokenState::Completed {
        return Err(DownloadError::AlreadyCompleted);
    }
    let meta = state.assets().resolve(&record.asset_id).await?;

    let range_header = match headers.get(RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| DownloadError::RangeNotSatisfiable { len: meta.len })?,
        ),
        None => None,
    };
    let resolved = resolve_range(range_header, meta.len)
        .map_err(|_| DownloadError::RangeNotSatisfiable { len: meta.len })?;
    let builder = asset_response(&meta, resolved);

    if *method == Method::HEAD {
        return Ok(builder
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())));
    }

    let interval = resolved.range();
    let settlement = state
        .acquire_settlement(token, interval, meta.len)
        .await?;

    let reader = match state.assets().open(&record.asset_id, interval.start).await {
        Ok(reader) => reader,
        Err(err) => {
            settlement.settle(0, SessionEnd::Failed).await;
            return Err(err.into());
        }
    };
    info!(
        tok = %token_tag(token),
        asset = %record.asset_id,
        range = %interval,
        size = meta.len,
        "download session started"
    );
    let stream = ReaderStream::with_capacity(reader.take(interval.len()), state.chunk_size());
    let body = TrackedBody::new(stream, settlement);
    Ok(builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

async fn load_token(state: &AppState, token: &str) -> Result<DownloadToken, DownloadError> {
    state
        .kernel()
        .get_token_async(token)
        .await
        .map_err(DownloadError::Storage)?
        .ok_or(DownloadError::TokenInvalid)
}

fn asset_response(meta: &AssetMeta, resolved: ResolvedRange) -> axum::http::response::Builder {
    let range = resolved.range();
    let disposition = format!("attachment; filename=\"{}\"", meta.file_name);
    let mut builder = Response::builder()
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_TYPE, meta.content_type)
        .header(CACHE_CONTROL, "no-store")
        .header(X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(CONTENT_LENGTH, range.len().to_string());
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        builder = builder.header(CONTENT_DISPOSITION, value);
    }
    if let Some(modified) = meta.modified {
        builder = builder.header(LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }
    match resolved {
        ResolvedRange::Partial(r) => builder.status(StatusCode::PARTIAL_CONTENT).header(
            CONTENT_RANGE,
            format!("bytes {}-{}/{}", r.start, r.end, meta.len),
        ),
        ResolvedRange::Full(_) => builder.status(StatusCode::OK),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct DownloadStatus {
    pub token_state: TokenState,
    pub asset_id: String,
    pub size: u64,
    pub covered_bytes: u64,
    pub coverage: Vec<ByteRange>,
    pub missing: Vec<ByteRange>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notified: bool,
}

/// `GET /download/status?token=`: read-only progress report for a token.
pub(crate) async fn download_status(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let result = async {
        let record = load_token(&state, query.token()?).await?;
        let meta = state.assets().resolve(&record.asset_id).await?;
        Ok::<_, DownloadError>(DownloadStatus {
            token_state: record.state,
            size: meta.len,
            covered_bytes: record.coverage.total_covered(),
            coverage: record.coverage.ranges().to_vec(),
            missing: record.coverage.missing(meta.len),
            completed_at: record.completed_at,
            notified: record.notified_at.is_some(),
            asset_id: record.asset_id,
        })
    }
    .await;
    match result {
        Ok(status) => {
            let mut resp = Json(status).into_response();
            resp.headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            resp
        }
        Err(err) => err.into_response(),
    }
}
