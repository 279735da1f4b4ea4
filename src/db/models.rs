//! Database Models - structs representing database tables (used by sqlx).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::subscribers::Subscriber;

/// Row of the `subscribers` table
#[derive(Debug, Clone, FromRow)]
pub struct SubscriberRow {
    pub email: String,
    pub subscribed: bool,
    pub subscribed_at: DateTime<Utc>,
    pub last_email_sent: Option<DateTime<Utc>>,
}

impl From<SubscriberRow> for Subscriber {
    fn from(row: SubscriberRow) -> Self {
        Subscriber {
            email: row.email,
            subscribed: row.subscribed,
            subscribed_at: row.subscribed_at,
            last_email_sent: row.last_email_sent,
        }
    }
}
