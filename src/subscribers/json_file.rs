//! Flat JSON file backend. The file holds a top-level array of subscribers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    canonical_email, merge_duplicates, StoreError, SubscribeOutcome, Subscriber, SubscriberStore,
    UnsubscribeOutcome,
};

pub struct JsonFileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process. Other
    // processes writing the same file still race; the last write wins.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written by older tools may carry mixed-case or padded
    /// addresses; they are canonicalised and merged on every read.
    async fn load(&self) -> Result<Vec<Subscriber>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(merge_duplicates(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, subscribers: &[Subscriber]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(subscribers)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for JsonFileStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    async fn subscribe(&self, email: &str) -> Result<SubscribeOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        let mut subscribers = self.load().await?;

        let outcome = match subscribers.iter_mut().find(|s| s.email == email) {
            Some(existing) if existing.subscribed => return Ok(SubscribeOutcome::AlreadySubscribed),
            Some(existing) => {
                existing.subscribed = true;
                existing.subscribed_at = Utc::now();
                SubscribeOutcome::Resubscribed
            }
            None => {
                subscribers.push(Subscriber::new(email.to_string(), Utc::now()));
                SubscribeOutcome::Created
            }
        };

        self.save(&subscribers).await?;
        Ok(outcome)
    }

    async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome, StoreError> {
        let _guard = self.lock.lock().await;
        let mut subscribers = self.load().await?;

        match subscribers.iter_mut().find(|s| s.email == email) {
            None => Ok(UnsubscribeOutcome::NotFound),
            Some(existing) if !existing.subscribed => Ok(UnsubscribeOutcome::AlreadyUnsubscribed),
            Some(existing) => {
                existing.subscribed = false;
                self.save(&subscribers).await?;
                Ok(UnsubscribeOutcome::Unsubscribed)
            }
        }
    }

    async fn get(&self, email: &str) -> Result<Option<Subscriber>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_iter().find(|s| s.email == email))
    }

    async fn list(&self) -> Result<Vec<Subscriber>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn mark_sent(&self, emails: &[String], at: DateTime<Utc>) -> Result<(), StoreError> {
        if emails.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let mut subscribers = self.load().await?;
        for subscriber in subscribers.iter_mut() {
            if emails.contains(&subscriber.email) {
                subscriber.last_email_sent = Some(at);
            }
        }
        self.save(&subscribers).await
    }

    async fn remove(&self, email: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut subscribers = self.load().await?;
        let before = subscribers.len();
        subscribers.retain(|s| s.email != email);
        if subscribers.len() == before {
            return Ok(false);
        }
        self.save(&subscribers).await?;
        Ok(true)
    }

    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        let mut subscriber = subscriber.clone();
        subscriber.email = canonical_email(&subscriber.email);

        let _guard = self.lock.lock().await;
        let mut subscribers = self.load().await?;
        match subscribers.iter_mut().find(|s| s.email == subscriber.email) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
        self.save(&subscribers).await
    }
}
