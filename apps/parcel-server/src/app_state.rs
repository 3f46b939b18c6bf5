use std::sync::Arc;

use parcel_core::config::{DEFAULT_CHUNK_KB, DEFAULT_NOTIFY_TEMPLATE};
use parcel_core::ByteRange;
use parcel_kernel::{Kernel, Lease};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::assets::ResourceLocator;
use crate::dispatch::CompletionDispatcher;
use crate::leases::{token_tag, LeaseError, LeaseManager};
use crate::notify::Notifier;
use crate::session::Settlement;

#[derive(Clone)]
pub(crate) struct AppState {
    kernel: Kernel,
    leases: LeaseManager,
    assets: Arc<dyn ResourceLocator>,
    dispatcher: Arc<CompletionDispatcher>,
    tasks: TaskTracker, // settlements and notifications outliving a request
    chunk_size: usize,
}

pub(crate) struct AppStateBuilder {
    kernel: Kernel,
    assets: Arc<dyn ResourceLocator>,
    notifier: Arc<dyn Notifier>,
    template_id: String,
    chunk_size: usize,
    tasks: Option<TaskTracker>,
}

impl AppState {
    pub(crate) fn builder(
        kernel: Kernel,
        assets: Arc<dyn ResourceLocator>,
        notifier: Arc<dyn Notifier>,
    ) -> AppStateBuilder {
        AppStateBuilder {
            kernel,
            assets,
            notifier,
            template_id: DEFAULT_NOTIFY_TEMPLATE.to_string(),
            chunk_size: DEFAULT_CHUNK_KB * 1024,
            tasks: None,
        }
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    #[cfg(test)]
    pub(crate) fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub(crate) fn assets(&self) -> &Arc<dyn ResourceLocator> {
        &self.assets
    }

    #[cfg(test)]
    pub(crate) fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn settlement(&self, lease: Lease, interval: ByteRange, len: u64) -> Settlement {
        Settlement::new(
            self.leases.clone(),
            self.dispatcher.clone(),
            lease,
            interval,
            len,
            self.tasks.clone(),
        )
    }

    /// Take the token's lease and wrap it in a [`Settlement`].
    ///
    /// The acquire runs as a tracked task: if the caller goes away before the
    /// guard is handed over, the guard is dropped there and the lease released.
    pub(crate) async fn acquire_settlement(
        &self,
        token: &str,
        interval: ByteRange,
        len: u64,
    ) -> Result<Settlement, LeaseError> {
        let (tx, rx) = oneshot::channel();
        let state = self.clone();
        let token = token.to_string();
        self.tasks.spawn(async move {
            let acquired = state
                .leases
                .try_acquire(&token)
                .await
                .map(|lease| state.settlement(lease, interval, len));
            if let Err(Ok(_unclaimed)) = tx.send(acquired) {
                debug!(tok = %token_tag(&token), "request gone before lease hand-over");
            }
        });
        rx.await
            .map_err(|_| LeaseError::Storage(anyhow::anyhow!("lease task ended without a result")))?
    }
}

impl AppStateBuilder {
    pub(crate) fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = template_id.into();
        self
    }

    pub(crate) fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn with_tasks(mut self, tasks: TaskTracker) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub(crate) fn build(self) -> AppState {
        let tasks = self.tasks.unwrap_or_default();
        let dispatcher = Arc::new(CompletionDispatcher::new(
            self.kernel.clone(),
            self.notifier,
            self.template_id,
            tasks.clone(),
        ));
        AppState {
            leases: LeaseManager::new(self.kernel.clone()),
            kernel: self.kernel,
            assets: self.assets,
            dispatcher,
            tasks,
            chunk_size: self.chunk_size,
        }
    }
}
