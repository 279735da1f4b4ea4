//! Shared handles passed to every handler and to the scheduler.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db;
use crate::newsletter::{Newsletter, NewsletterError, RunGuard};
use crate::subscribers::{JsonFileStore, PgSubscriberStore, SubscriberStore};
use crate::webhook::WebhookStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub subscribers: Arc<dyn SubscriberStore>,
    pub newsletter: Arc<Newsletter>,
    pub webhook: Arc<WebhookStore>,
    pub run_guard: RunGuard,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        subscribers: Arc<dyn SubscriberStore>,
        newsletter: Newsletter,
    ) -> Self {
        let webhook = WebhookStore::new(config.webhook_file.clone());
        Self {
            config: Arc::new(config),
            subscribers,
            newsletter: Arc::new(newsletter),
            webhook: Arc::new(webhook),
            run_guard: RunGuard::default(),
        }
    }

    /// Build the production wiring: Postgres-backed subscribers when a
    /// database is reachable, the JSON file otherwise.
    pub async fn from_config(config: AppConfig) -> Result<Self, NewsletterError> {
        let subscribers = open_subscriber_store(&config).await;
        let newsletter = Newsletter::from_config(&config)?;
        Ok(Self::new(config, subscribers, newsletter))
    }
}

pub async fn open_subscriber_store(config: &AppConfig) -> Arc<dyn SubscriberStore> {
    match db::connect_if_configured(&config.db).await {
        Some(pool) => {
            tracing::info!("Using Postgres subscriber store");
            let store = PgSubscriberStore::new(pool);
            if let Err(e) = store.normalize_stored_emails().await {
                tracing::error!(error = %e, "Failed to normalize stored subscriber emails");
            }
            Arc::new(store)
        }
        None => {
            tracing::info!(
                path = %config.subscribers_file.display(),
                "Using JSON file subscriber store"
            );
            Arc::new(JsonFileStore::new(config.subscribers_file.clone()))
        }
    }
}
