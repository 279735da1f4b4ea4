/**
 * Webhook Route
 * External trigger for a newsletter run (e.g. a hosted cron service)
 */
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::newsletter::DeliveryOptions;
use crate::state::AppState;
use crate::webhook::Rejection;

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookQuery {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub accepted: bool,
    pub triggered_at: DateTime<Utc>,
    pub dry_run: bool,
}

fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
}

/// POST /api/newsletter/webhook
pub async fn trigger(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let config = state.webhook.load().await?;

    if let Err(rejection) = config.authorize(addr.ip(), presented_secret(&headers)) {
        tracing::warn!(ip = %addr.ip(), reason = %rejection, "webhook trigger rejected");
        return Err(match rejection {
            Rejection::Disabled | Rejection::ForbiddenIp => AppError::Forbidden(rejection.to_string()),
            Rejection::BadSecret => AppError::Unauthorized(rejection.to_string()),
        });
    }

    // Claim the run slot before answering so a busy pipeline reports 409
    let running = state.run_guard.try_start()?;

    let triggered_at = Utc::now();
    state.webhook.touch(triggered_at).await?;

    let options = DeliveryOptions {
        dry_run: query.dry_run,
        ..Default::default()
    };
    let task_state = state.clone();
    tokio::spawn(async move {
        let _running = running;
        match task_state
            .newsletter
            .run(task_state.subscribers.as_ref(), &options)
            .await
        {
            Ok(report) => tracing::info!(
                delivered = report.delivery.delivered,
                failed = report.delivery.failed.len(),
                "webhook newsletter run completed"
            ),
            Err(e) => tracing::error!(error = %e, "webhook newsletter run failed"),
        }
    });

    tracing::info!(ip = %addr.ip(), dry_run = query.dry_run, "webhook trigger accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            accepted: true,
            triggered_at,
            dry_run: query.dry_run,
        }),
    ))
}
