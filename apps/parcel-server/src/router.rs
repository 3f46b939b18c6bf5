use axum::{routing::get, Router};

use crate::{api, AppState};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const DOWNLOAD: &str = "/download";
    pub const DOWNLOAD_STATUS: &str = "/download/status";
}

/// All routes. `GET` handlers also answer `HEAD`.
pub(crate) fn build() -> Router<AppState> {
    Router::new()
        .route(paths::HEALTHZ, get(api::meta::healthz))
        .route(paths::DOWNLOAD, get(api::download::download))
        .route(paths::DOWNLOAD_STATUS, get(api::download::download_status))
}
