/**
 * Mailer
 * Delivery through a transactional mail HTTP API, or to the log.
 */
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{http_client, NewsletterError};
use crate::config::MailConfig;

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// RFC 8058 one-click unsubscribe target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Short name for logs and health output
    fn kind(&self) -> &'static str;

    async fn send(&self, email: &OutgoingEmail) -> Result<(), NewsletterError>;
}

pub struct HttpMailer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpMailer {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NewsletterError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), NewsletterError> {
        let mut request = self.client.post(&self.url).json(email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NewsletterError::upstream("mail", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NewsletterError::UpstreamStatus {
                service: "mail",
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Logs each message instead of delivering it
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), NewsletterError> {
        tracing::info!(
            to = ?email.to,
            subject = %email.subject,
            html_bytes = email.html.len(),
            text_bytes = email.text.len(),
            "mail not sent (log mailer)"
        );
        tracing::debug!(text = %email.text, "log mailer body");
        Ok(())
    }
}

/// HTTP mailer when an endpoint is configured, log mailer otherwise.
pub fn from_config(config: &MailConfig) -> Result<Box<dyn Mailer>, NewsletterError> {
    match &config.api_url {
        Some(url) => Ok(Box::new(HttpMailer::new(
            url.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => {
            tracing::warn!("MAIL_API_URL not set. Newsletter emails will only be logged.");
            Ok(Box::new(LogMailer))
        }
    }
}
