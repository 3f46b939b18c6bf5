use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub(crate) enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification endpoint answered {0}")]
    Rejected(u16),
}

/// Outbound channel for completion messages. Delivery is at-most-once from
/// the caller's side; implementations must not retry on their own.
#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        variables: &Value,
    ) -> Result<(), NotifyError>;
}

/// POSTs `{recipient, template, variables}` as JSON to a fixed URL.
pub(crate) struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub(crate) fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("parcel-server/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout.min(Duration::from_secs(3)))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        variables: &Value,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "recipient": recipient,
            "template": template_id,
            "variables": variables,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(status.as_u16()))
        }
    }
}

/// Writes the notification to the service log instead of sending it.
pub(crate) struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        variables: &Value,
    ) -> Result<(), NotifyError> {
        info!(
            target: "parcel::notify",
            recipient,
            template = template_id,
            variables = %variables,
            "completion notification (log only)"
        );
        Ok(())
    }
}
