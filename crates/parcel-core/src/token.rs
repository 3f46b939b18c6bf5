use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coverage::CoverageSet;

/// Lifecycle state of a download token.
///
/// Transitions only run `Issued|Paused -> Locked -> {Paused, Completed}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Issued,
    Locked,
    Paused,
    Completed,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Issued => "issued",
            TokenState::Locked => "locked",
            TokenState::Paused => "paused",
            TokenState::Completed => "completed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "issued" => Some(TokenState::Issued),
            "locked" => Some(TokenState::Locked),
            "paused" => Some(TokenState::Paused),
            "completed" => Some(TokenState::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state requested when a lease is given back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Paused,
    Completed,
}

impl ReleaseOutcome {
    pub fn state(&self) -> TokenState {
        match self {
            ReleaseOutcome::Paused => TokenState::Paused,
            ReleaseOutcome::Completed => TokenState::Completed,
        }
    }
}

/// Persisted token record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DownloadToken {
    pub token: String,
    pub recipient: String,
    pub asset_id: String,
    pub state: TokenState,
    pub coverage: CoverageSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}
