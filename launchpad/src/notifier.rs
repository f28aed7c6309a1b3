//! Webhook delivery of final run outcomes.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{PipelineError, Result};
use crate::model::Notification;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Any non-2xx answer is a failure.
    async fn notify(&self, url: &Url, notification: &Notification) -> Result<()>;
}

/// Plain JSON POST webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    timeout: Duration,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, url: &Url, notification: &Notification) -> Result<()> {
        let resp = self
            .http
            .post(url.clone())
            .timeout(self.timeout)
            .json(notification)
            .send()
            .await
            .map_err(|e| PipelineError::Notify(format!("{url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Notify(format!("{url} answered {status}: {body}")));
        }
        tracing::debug!(%url, status = ?notification.status, "webhook delivered");
        Ok(())
    }
}
