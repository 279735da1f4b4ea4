/*!
 * Subscribers
 * Subscriber records and the storage backends that hold them.
 */
pub mod json_file;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json_file::JsonFileStore;
pub use postgres::PgSubscriberStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub email: String,
    pub subscribed: bool,
    pub subscribed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_email_sent: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn new(email: String, now: DateTime<Utc>) -> Self {
        Self {
            email,
            subscribed: true,
            subscribed_at: now,
            last_email_sent: None,
        }
    }

    /// Fold another record for the same address into this one.
    fn absorb(&mut self, other: Subscriber) {
        self.subscribed |= other.subscribed;
        self.subscribed_at = self.subscribed_at.min(other.subscribed_at);
        self.last_email_sent = self.last_email_sent.max(other.last_email_sent);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    Created,
    Resubscribed,
    AlreadySubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    AlreadyUnsubscribed,
    NotFound,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("subscriber file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("subscriber file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

lazy_static::lazy_static! {
    /// Pragmatic address check: one @, no whitespace, a dot in the domain
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"^[^\s@]+@[^\s@.]+(?:\.[^\s@.]+)+$").unwrap();
}

/// Trim, lower-case and validate an address. Stored emails are always in
/// this form so the email column can act as the unique key.
pub fn normalize_email(raw: &str) -> Result<String, StoreError> {
    let email = canonical_email(raw);
    if email.len() > 254 || !EMAIL_REGEX.is_match(&email) {
        return Err(StoreError::InvalidEmail(raw.trim().to_string()));
    }
    Ok(email)
}

/// Trim and lower-case without validating. Applied to records that are
/// already stored, which may predate validation.
pub fn canonical_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Canonicalise every address and merge records that collapse onto the same
/// one. First-seen order is kept.
pub fn merge_duplicates(subscribers: Vec<Subscriber>) -> Vec<Subscriber> {
    let mut merged: Vec<Subscriber> = Vec::with_capacity(subscribers.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for mut subscriber in subscribers {
        subscriber.email = canonical_email(&subscriber.email);
        match positions.get(&subscriber.email) {
            Some(&i) => merged[i].absorb(subscriber),
            None => {
                positions.insert(subscriber.email.clone(), merged.len());
                merged.push(subscriber);
            }
        }
    }

    merged
}

/// Subscriber persistence.
///
/// Every method expects an already normalized email.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    async fn subscribe(&self, email: &str) -> Result<SubscribeOutcome, StoreError>;

    async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome, StoreError>;

    async fn get(&self, email: &str) -> Result<Option<Subscriber>, StoreError>;

    async fn list(&self) -> Result<Vec<Subscriber>, StoreError>;

    /// Record a successful delivery for each address
    async fn mark_sent(&self, emails: &[String], at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete the record entirely. Returns false when it did not exist.
    async fn remove(&self, email: &str) -> Result<bool, StoreError>;

    /// Insert or overwrite a full record, used when copying between backends
    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError>;

    async fn active(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.subscribed)
            .collect())
    }
}

/// Copy every record from `source` into `target`, returning how many were written.
pub async fn import_into(
    source: &dyn SubscriberStore,
    target: &dyn SubscriberStore,
) -> Result<usize, StoreError> {
    let subscribers = merge_duplicates(source.list().await?);
    for subscriber in &subscribers {
        target.upsert(subscriber).await?;
    }
    tracing::info!(
        from = source.backend(),
        to = target.backend(),
        count = subscribers.len(),
        "imported subscribers"
    );
    Ok(subscribers.len())
}
