/*!
 * Webhook Configuration
 * JSON document controlling the external newsletter trigger.
 */
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

const SECRET_LENGTH: usize = 48;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("webhook is disabled")]
    Disabled,
    #[error("client address is not allowed")]
    ForbiddenIp,
    #[error("invalid webhook secret")]
    BadSecret,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook config I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("webhook config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn generate_secret() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SECRET_LENGTH)
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

fn ip_allowed(allowed: &[String], client: IpAddr) -> bool {
    if allowed.is_empty() {
        return true;
    }
    // IPv4 clients may arrive as IPv4-mapped IPv6 on dual-stack listeners
    let client = match client {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(client),
        v4 => v4,
    };
    allowed
        .iter()
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .any(|ip| ip == client)
}

impl WebhookConfig {
    /// Decide whether a trigger request may proceed.
    pub fn authorize(&self, client: IpAddr, presented_secret: Option<&str>) -> Result<(), Rejection> {
        if !self.enabled || self.webhook_secret.is_empty() {
            return Err(Rejection::Disabled);
        }
        if !ip_allowed(&self.allowed_ips, client) {
            return Err(Rejection::ForbiddenIp);
        }
        match presented_secret {
            Some(secret) if secrets_match(&self.webhook_secret, secret) => Ok(()),
            _ => Err(Rejection::BadSecret),
        }
    }
}

/// File-backed holder of the webhook config. Each write replaces the file.
pub struct WebhookStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl WebhookStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<WebhookConfig, WebhookError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(WebhookConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, config: &WebhookConfig) -> Result<(), WebhookError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(config)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Missing file reads as the disabled default
    pub async fn load(&self) -> Result<WebhookConfig, WebhookError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn save(&self, config: &WebhookConfig) -> Result<(), WebhookError> {
        let _guard = self.lock.lock().await;
        self.write(config).await
    }

    /// Apply `change` to the stored config and persist the result.
    pub async fn update<F>(&self, change: F) -> Result<WebhookConfig, WebhookError>
    where
        F: FnOnce(&mut WebhookConfig),
    {
        let _guard = self.lock.lock().await;
        let mut config = self.read().await?;
        change(&mut config);
        self.write(&config).await?;
        Ok(config)
    }

    pub async fn touch(&self, at: DateTime<Utc>) -> Result<WebhookConfig, WebhookError> {
        self.update(|c| c.last_triggered = Some(at)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(secret: &str, ips: &[&str]) -> WebhookConfig {
        WebhookConfig {
            webhook_secret: secret.to_string(),
            allowed_ips: ips.iter().map(|s| s.to_string()).collect(),
            enabled: true,
            last_triggered: None,
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(enabled("s", &["10.0.0.1"])).unwrap();
        assert_eq!(json["webhookSecret"], "s");
        assert_eq!(json["allowedIPs"][0], "10.0.0.1");
        assert!(json["lastTriggered"].is_null());
    }

    #[test]
    fn test_authorize_disabled() {
        let mut config = enabled("secret", &[]);
        config.enabled = false;
        assert_eq!(config.authorize(localhost(), Some("secret")), Err(Rejection::Disabled));
    }

    #[test]
    fn test_authorize_empty_secret_counts_as_disabled() {
        let config = enabled("", &[]);
        assert_eq!(config.authorize(localhost(), Some("")), Err(Rejection::Disabled));
    }

    #[test]
    fn test_authorize_checks_ip_then_secret() {
        let config = enabled("secret", &["10.0.0.5", "not-an-ip"]);
        assert_eq!(config.authorize(localhost(), Some("secret")), Err(Rejection::ForbiddenIp));

        let allowed: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(config.authorize(allowed, Some("wrong")), Err(Rejection::BadSecret));
        assert_eq!(config.authorize(allowed, None), Err(Rejection::BadSecret));
        assert_eq!(config.authorize(allowed, Some("secret")), Ok(()));
    }

    #[test]
    fn test_ipv4_mapped_client_matches_ipv4_entry() {
        let config = enabled("secret", &["10.0.0.5"]);
        let mapped: IpAddr = "::ffff:10.0.0.5".parse().unwrap();
        assert_eq!(config.authorize(mapped, Some("secret")), Ok(()));
    }

    #[test]
    fn test_generate_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[tokio::test]
    async fn test_store_missing_file_is_disabled_default() {
        let path = std::env::temp_dir().join(format!("webhook-{}.json", uuid::Uuid::new_v4()));
        let store = WebhookStore::new(path);
        let config = store.load().await.unwrap();
        assert!(!config.enabled);
        assert!(config.webhook_secret.is_empty());
    }

    #[tokio::test]
    async fn test_store_touch_persists_last_triggered() {
        let path = std::env::temp_dir().join(format!("webhook-{}.json", uuid::Uuid::new_v4()));
        let store = WebhookStore::new(path);
        store.save(&enabled("secret", &[])).await.unwrap();

        let at = Utc::now();
        store.touch(at).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.last_triggered, Some(at));
        assert_eq!(reloaded.webhook_secret, "secret");
    }
}
