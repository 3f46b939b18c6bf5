use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parcel_core::ParcelConfig;
use parcel_kernel::Kernel;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::assets::FsAssets;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::{access_log, router, AppState};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
    pub background_tasks: TaskTracker,
}

/// Open the token store, release leases stranded by a previous process and
/// assemble the shared state.
pub(crate) async fn build(config: &ParcelConfig) -> anyhow::Result<BootstrapOutput> {
    let kernel = Kernel::open(&config.storage.state_dir)
        .with_context(|| format!("open token store in {}", config.storage.state_dir.display()))?;
    let recovered = kernel.recover_stale_leases_async().await?;
    if recovered > 0 {
        warn!(recovered, "released leases left locked by a previous run");
    }

    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.as_deref() {
        Some(url) => {
            info!(url, "completion notifications go to webhook");
            Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.notify.timeout_secs.max(1)),
            )?)
        }
        None => {
            info!("no notification webhook configured; logging completions");
            Arc::new(LogNotifier)
        }
    };

    let background_tasks = TaskTracker::new();
    let state = AppState::builder(
        kernel,
        Arc::new(FsAssets::new(&config.assets.dir)),
        notifier,
    )
    .with_template(config.notify.template.clone())
    .with_chunk_size(config.chunk_size())
    .with_tasks(background_tasks.clone())
    .build();

    Ok(BootstrapOutput {
        router: router::build(),
        state,
        background_tasks,
    })
}

pub(crate) fn attach_state(router: axum::Router<AppState>, state: AppState) -> axum::Router<()> {
    router.with_state::<()>(state)
}

/// No compression layer: it would drop `Content-Length` and break ranges.
pub(crate) fn attach_http_layers(
    router: axum::Router<()>,
    concurrency_limit: usize,
) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}

pub(crate) fn attach_global_layers(router: axum::Router<()>) -> axum::Router<()> {
    router.layer(axum::middleware::from_fn(access_log::access_log_mw))
}
