use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::assets::ResourceError;
use crate::leases::LeaseError;
use crate::responses::{error_response, range_not_satisfiable};

/// Every way a download request can be refused.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadError {
    #[error("no token supplied")]
    NoToken,
    #[error("token is not valid")]
    TokenInvalid,
    #[error("download already completed")]
    AlreadyCompleted,
    #[error("download in progress in another session")]
    InProgress,
    #[error("range not satisfiable for {len} bytes")]
    RangeNotSatisfiable { len: u64 },
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl DownloadError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            DownloadError::NoToken | DownloadError::TokenInvalid => StatusCode::BAD_REQUEST,
            DownloadError::AlreadyCompleted => StatusCode::FORBIDDEN,
            DownloadError::InProgress => StatusCode::CONFLICT,
            DownloadError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            DownloadError::Resource(_) | DownloadError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn code(&self) -> &'static str {
        match self {
            DownloadError::NoToken => "NO_TOKEN",
            DownloadError::TokenInvalid => "TOKEN_INVALID",
            DownloadError::AlreadyCompleted => "DOWNLOAD_ALREADY_COMPLETED",
            DownloadError::InProgress => "DOWNLOAD_IN_PROGRESS",
            DownloadError::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            DownloadError::Resource(ResourceError::Empty(_)) => "RESOURCE_EMPTY",
            DownloadError::Resource(_) => "RESOURCE_NOT_FOUND",
            DownloadError::Storage(_) => "INTERNAL",
        }
    }
}

impl From<LeaseError> for DownloadError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::TokenNotFound => DownloadError::TokenInvalid,
            LeaseError::TokenAlreadyCompleted => DownloadError::AlreadyCompleted,
            LeaseError::TokenLocked => DownloadError::InProgress,
            LeaseError::Storage(err) => DownloadError::Storage(err),
        }
    }
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        match &self {
            DownloadError::RangeNotSatisfiable { len } => return range_not_satisfiable(*len),
            DownloadError::Resource(err) => error!(error = %err, "asset unavailable"),
            DownloadError::Storage(err) => error!(error = %err, "token store failure"),
            _ => {}
        }
        error_response(self.status(), self.code())
    }
}
