use std::sync::Arc;

use parcel_kernel::{Kernel, Lease};
use serde_json::json;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::leases::token_tag;
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// This call claimed the marker and handed the message to the notifier.
    Scheduled,
    AlreadyNotified,
}

/// Sends the completion message at most once per token.
pub(crate) struct CompletionDispatcher {
    kernel: Kernel,
    notifier: Arc<dyn Notifier>,
    template_id: String,
    tasks: TaskTracker,
}

impl CompletionDispatcher {
    pub(crate) fn new(
        kernel: Kernel,
        notifier: Arc<dyn Notifier>,
        template_id: impl Into<String>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            kernel,
            notifier,
            template_id: template_id.into(),
            tasks,
        }
    }

    /// Claim the notification marker and, if won, send in the background.
    /// A failed send is logged and never retried; the token stays completed.
    pub(crate) async fn dispatch(&self, lease: &Lease) -> anyhow::Result<DispatchOutcome> {
        if !self.kernel.claim_notification_async(&lease.token).await? {
            debug!(tok = %token_tag(&lease.token), "completion already notified");
            return Ok(DispatchOutcome::AlreadyNotified);
        }

        let notifier = self.notifier.clone();
        let template = self.template_id.clone();
        let recipient = lease.recipient.clone();
        let tag = token_tag(&lease.token);
        let variables = json!({
            "asset_id": lease.asset_id,
            "completed_at": chrono::Utc::now().to_rfc3339(),
        });
        self.tasks.spawn(async move {
            match notifier.send(&recipient, &template, &variables).await {
                Ok(()) => info!(tok = %tag, template = %template, "completion notification sent"),
                Err(err) => warn!(
                    tok = %tag,
                    template = %template,
                    error = %err,
                    "completion notification failed; not retried"
                ),
            }
        });
        Ok(DispatchOutcome::Scheduled)
    }
}
