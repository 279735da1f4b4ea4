//! Postgres backend over the `subscribers` table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

use super::{
    canonical_email, merge_duplicates, StoreError, SubscribeOutcome, Subscriber, SubscriberStore,
    UnsubscribeOutcome,
};
use crate::db::models::SubscriberRow;

pub struct PgSubscriberStore {
    pool: Arc<PgPool>,
}

impl PgSubscriberStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Rewrite rows whose email is not trimmed and lower-cased, merging
    /// them into any row already holding the canonical address. Returns
    /// the number of legacy rows rewritten.
    pub async fn normalize_stored_emails(&self) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let legacy = sqlx::query_as::<_, SubscriberRow>(
            r#"
            SELECT email, subscribed, subscribed_at, last_email_sent
            FROM subscribers
            WHERE email <> lower(btrim(email, E' \t\r\n'))
            ORDER BY subscribed_at ASC
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if legacy.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let legacy_emails: Vec<String> = legacy.iter().map(|row| row.email.clone()).collect();
        let canonical: Vec<String> = legacy_emails.iter().map(|e| canonical_email(e)).collect();

        let existing = sqlx::query_as::<_, SubscriberRow>(
            r#"
            SELECT email, subscribed, subscribed_at, last_email_sent
            FROM subscribers
            WHERE email = ANY($1)
            FOR UPDATE
            "#,
        )
        .bind(&canonical)
        .fetch_all(&mut *tx)
        .await?;

        let merged = merge_duplicates(
            existing
                .into_iter()
                .chain(legacy)
                .map(Subscriber::from)
                .collect(),
        );

        sqlx::query("DELETE FROM subscribers WHERE email = ANY($1) OR email = ANY($2)")
            .bind(&legacy_emails)
            .bind(&canonical)
            .execute(&mut *tx)
            .await?;

        for subscriber in &merged {
            write_subscriber(&mut *tx, subscriber).await?;
        }

        tx.commit().await?;

        tracing::info!(
            rewritten = legacy_emails.len(),
            merged_into = merged.len(),
            "Normalized legacy subscriber emails"
        );

        Ok(legacy_emails.len())
    }
}

fn subscribe_outcome(row: Option<(bool,)>) -> SubscribeOutcome {
    match row {
        Some((true,)) => SubscribeOutcome::Created,
        Some((false,)) => SubscribeOutcome::Resubscribed,
        None => SubscribeOutcome::AlreadySubscribed,
    }
}

fn unsubscribe_outcome(rows_affected: u64, exists: bool) -> UnsubscribeOutcome {
    match (rows_affected, exists) {
        (n, _) if n > 0 => UnsubscribeOutcome::Unsubscribed,
        (_, true) => UnsubscribeOutcome::AlreadyUnsubscribed,
        (_, false) => UnsubscribeOutcome::NotFound,
    }
}

async fn write_subscriber<'e, E>(executor: E, subscriber: &Subscriber) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO subscribers (email, subscribed, subscribed_at, last_email_sent)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
            SET subscribed = EXCLUDED.subscribed,
                subscribed_at = EXCLUDED.subscribed_at,
                last_email_sent = EXCLUDED.last_email_sent
        "#,
    )
    .bind(canonical_email(&subscriber.email))
    .bind(subscriber.subscribed)
    .bind(subscriber.subscribed_at)
    .bind(subscriber.last_email_sent)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl SubscriberStore for PgSubscriberStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn subscribe(&self, email: &str) -> Result<SubscribeOutcome, StoreError> {
        // xmax = 0 distinguishes a fresh insert from the conflict branch
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO subscribers (email, subscribed, subscribed_at)
            VALUES ($1, true, now())
            ON CONFLICT (email) DO UPDATE
                SET subscribed = true, subscribed_at = now()
                WHERE subscribers.subscribed = false
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(subscribe_outcome(row))
    }

    async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE subscribers SET subscribed = false WHERE email = $1 AND subscribed = true",
        )
        .bind(email)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(unsubscribe_outcome(result.rows_affected(), true));
        }

        let exists = self.get(email).await?.is_some();
        Ok(unsubscribe_outcome(0, exists))
    }

    async fn get(&self, email: &str) -> Result<Option<Subscriber>, StoreError> {
        let row = sqlx::query_as::<_, SubscriberRow>(
            r#"
            SELECT email, subscribed, subscribed_at, last_email_sent
            FROM subscribers
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(Subscriber::from))
    }

    async fn list(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            r#"
            SELECT email, subscribed, subscribed_at, last_email_sent
            FROM subscribers
            ORDER BY subscribed_at ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Subscriber::from).collect())
    }

    async fn active(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            r#"
            SELECT email, subscribed, subscribed_at, last_email_sent
            FROM subscribers
            WHERE subscribed = true
            ORDER BY subscribed_at ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(Subscriber::from).collect())
    }

    async fn mark_sent(&self, emails: &[String], at: DateTime<Utc>) -> Result<(), StoreError> {
        if emails.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE subscribers SET last_email_sent = $1 WHERE email = ANY($2)")
            .bind(at)
            .bind(emails)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn remove(&self, email: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE email = $1")
            .bind(email)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        write_subscriber(self.pool.as_ref(), subscriber).await
    }
}
