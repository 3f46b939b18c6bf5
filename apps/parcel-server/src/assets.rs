use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeekExt};

pub(crate) type AssetReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssetMeta {
    pub len: u64,
    pub content_type: &'static str,
    pub file_name: String,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ResourceError {
    #[error("asset {0} not found")]
    NotFound(String),
    #[error("asset {0} is empty")]
    Empty(String),
    #[error("asset io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps an asset id to its bytes. Implementations must be cheap to call once
/// per request; nothing is cached between calls.
#[async_trait]
pub(crate) trait ResourceLocator: Send + Sync {
    async fn resolve(&self, asset_id: &str) -> Result<AssetMeta, ResourceError>;

    /// Open the asset positioned at `start`.
    async fn open(&self, asset_id: &str, start: u64) -> Result<AssetReader, ResourceError>;
}

/// Assets stored as plain files directly under one directory.
#[derive(Debug, Clone)]
pub(crate) struct FsAssets {
    root: PathBuf,
}

impl FsAssets {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, asset_id: &str) -> Result<PathBuf, ResourceError> {
        let trimmed = asset_id.trim();
        let candidate = Path::new(trimmed);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !trimmed.contains(['/', '\\']) => {
                Ok(self.root.join(candidate))
            }
            _ => Err(ResourceError::NotFound(asset_id.to_string())),
        }
    }
}

#[async_trait]
impl ResourceLocator for FsAssets {
    async fn resolve(&self, asset_id: &str) -> Result<AssetMeta, ResourceError> {
        let path = self.path_for(asset_id)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(ResourceError::NotFound(asset_id.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResourceError::NotFound(asset_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        if meta.len() == 0 {
            return Err(ResourceError::Empty(asset_id.to_string()));
        }
        Ok(AssetMeta {
            len: meta.len(),
            content_type: content_type_for(&path),
            file_name: attachment_name(asset_id),
            modified: meta.modified().ok(),
        })
    }

    async fn open(&self, asset_id: &str, start: u64) -> Result<AssetReader, ResourceError> {
        let path = self.path_for(asset_id)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResourceError::NotFound(asset_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(Box::new(file))
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("epub") => "application/epub+zip",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("txt") => "text/plain; charset=utf-8",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Header-safe file name for `Content-Disposition`.
pub(crate) fn attachment_name(asset_id: &str) -> String {
    let cleaned: String = asset_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}
