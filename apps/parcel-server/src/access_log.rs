use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use sha2::Digest as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq)]
struct Cfg {
    enabled: bool,
    sample_n: u64,
    ua: bool,
    ua_hash: bool,
    trust_forward: bool,
}

impl Cfg {
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).as_deref() == Some("1");
        Cfg {
            enabled: flag("PARCEL_ACCESS_LOG"),
            sample_n: lookup("PARCEL_ACCESS_SAMPLE_N")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1)
                .max(1),
            ua: flag("PARCEL_ACCESS_UA"),
            ua_hash: flag("PARCEL_ACCESS_UA_HASH"),
            trust_forward: flag("PARCEL_TRUST_FORWARD_HEADERS"),
        }
    }
}

static CFG: Lazy<Cfg> = Lazy::new(|| Cfg::from_lookup(|key| std::env::var(key).ok()));

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn first_forwarded_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        let ip = v.split(',').next().unwrap_or("").trim();
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }
    if let Some(v) = headers.get("forwarded").and_then(|h| h.to_str().ok()) {
        for part in v.split(';').flat_map(|s| s.split(',')) {
            if let Some(rest) = part.trim().strip_prefix("for=") {
                return Some(rest.trim_matches('"').to_string());
            }
        }
    }
    None
}

/// One JSON line per request on the access target. The query string is
/// never logged since it carries the download token.
pub(crate) async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !CFG.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let remote = if CFG.trust_forward {
        first_forwarded_ip(req.headers()).or(peer)
    } else {
        peer
    };
    let range = req
        .headers()
        .get(axum::http::header::RANGE)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let ua = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let res = next.run(req).await;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if CFG.sample_n > 1 && n % CFG.sample_n != 0 {
        return res;
    }
    let mut obj = serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "method": method.as_str(),
        "path": path,
        "status": res.status().as_u16(),
        "dur_ms": started.elapsed().as_millis() as u64,
    });
    if let Some(ip) = remote {
        obj["remote"] = serde_json::Value::String(ip);
    }
    if let Some(range) = range {
        obj["range"] = serde_json::Value::String(range);
    }
    if let Some(ua) = ua {
        if CFG.ua_hash {
            let digest = sha2::Sha256::digest(ua.as_bytes());
            obj["ua_hash"] = serde_json::Value::String(hex::encode(digest));
        } else if CFG.ua {
            obj["ua"] = serde_json::Value::String(ua);
        }
    }
    tracing::info!(
        target: parcel_otel::ACCESS_TARGET,
        "{}",
        serde_json::to_string(&obj).unwrap_or_else(|_| "{}".into())
    );
    res
}
