use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parcel_core::DownloadToken;
use parcel_kernel::Kernel;
use serde_json::Value;
use tempfile::TempDir;

use crate::assets::{FsAssets, ResourceLocator};
use crate::notify::{Notifier, NotifyError};
use crate::AppState;

#[derive(Debug, Clone)]
pub(crate) struct SentNotification {
    pub recipient: String,
    pub template: String,
    pub variables: Value,
}

/// Notifier that records every call; optionally fails each send.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub(crate) fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        variables: &Value,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier lock")
            .push(SentNotification {
                recipient: recipient.to_string(),
                template: template_id.to_string(),
                variables: variables.clone(),
            });
        if self.fail {
            Err(NotifyError::Rejected(503))
        } else {
            Ok(())
        }
    }
}

/// Temp state dir, temp assets dir and an [`AppState`] wired to a
/// [`RecordingNotifier`].
pub(crate) struct Harness {
    _dir: TempDir,
    assets_dir: std::path::PathBuf,
    pub state: AppState,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub(crate) async fn new(notifier: RecordingNotifier) -> Self {
        Self::with_chunk_size(notifier, 64 * 1024).await
    }

    pub(crate) async fn with_chunk_size(notifier: RecordingNotifier, chunk_size: usize) -> Self {
        Self::build(notifier, chunk_size, |fs| Arc::new(fs) as Arc<dyn ResourceLocator>).await
    }

    /// Like [`Harness::new`] but serving assets through `wrap(FsAssets)`.
    pub(crate) async fn with_assets<F>(notifier: RecordingNotifier, wrap: F) -> Self
    where
        F: FnOnce(FsAssets) -> Arc<dyn ResourceLocator>,
    {
        Self::build(notifier, 64 * 1024, wrap).await
    }

    async fn build<F>(notifier: RecordingNotifier, chunk_size: usize, wrap: F) -> Self
    where
        F: FnOnce(FsAssets) -> Arc<dyn ResourceLocator>,
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets_dir = dir.path().join("assets");
        std::fs::create_dir_all(&assets_dir).expect("assets dir");
        let kernel = Kernel::open(&dir.path().join("state")).expect("open kernel");
        let notifier = Arc::new(notifier);
        let state = AppState::builder(kernel, wrap(FsAssets::new(&assets_dir)), notifier.clone())
            .with_chunk_size(chunk_size)
            .build();
        Self {
            _dir: dir,
            assets_dir,
            state,
            notifier,
        }
    }

    /// Write `len` deterministic bytes and return them.
    pub(crate) fn write_asset(&self, name: &str, len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(self.assets_dir.join(name), &payload).expect("write asset");
        payload
    }

    pub(crate) fn issue(&self, token: &str, asset_id: &str) {
        self.state
            .kernel()
            .issue_token(token, "buyer@example.com", asset_id)
            .expect("issue token");
    }

    pub(crate) fn token(&self, token: &str) -> DownloadToken {
        self.state
            .kernel()
            .get_token(token)
            .expect("read token")
            .expect("token exists")
    }

    /// Wait for background settlements and notification sends.
    pub(crate) async fn drain(&self) {
        let tasks = self.state.tasks();
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }
}
