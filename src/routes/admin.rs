/**
 * Admin Routes
 * Subscriber listing and manual newsletter runs, behind ADMIN_TOKEN
 */
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::newsletter::{DeliveryOptions, RunReport};
use crate::scheduler::Schedule;
use crate::state::AppState;
use crate::subscribers::{normalize_email, Subscriber};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberListResponse {
    pub backend: String,
    pub total: usize,
    pub active: usize,
    pub items: Vec<Subscriber>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewQuery {
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    pub backend: String,
    pub mailer: String,
    pub news_configured: bool,
    pub schedule: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub webhook_enabled: bool,
    pub last_triggered: Option<DateTime<Utc>>,
}

// ============================================================================
// Helper: admin bearer token
// ============================================================================

fn verify_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AppError::Unavailable("Admin API is disabled".to_string()));
    };

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(t) if Sha256::digest(t.as_bytes()) == Sha256::digest(expected.as_bytes()) => Ok(()),
        Some(_) => Err(AppError::Unauthorized("Invalid token".to_string())),
        None => Err(AppError::Unauthorized("Authorization required".to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/newsletter/subscribers
pub async fn list_subscribers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    verify_admin(&state, &headers)?;

    let items = state.subscribers.list().await?;
    let active = items.iter().filter(|s| s.subscribed).count();

    Ok(Json(SubscriberListResponse {
        backend: state.subscribers.backend().to_string(),
        total: items.len(),
        active,
        items,
    }))
}

/// POST /api/newsletter/send?dryRun=&limit=&only= - runs to completion.
/// The run is detached from the request, so a client that disconnects
/// does not cancel deliveries halfway.
pub async fn send_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut options): Query<DeliveryOptions>,
) -> Result<Json<RunReport>, AppError> {
    verify_admin(&state, &headers)?;

    if let Some(only) = options.only.take() {
        options.only = Some(normalize_email(&only)?);
    }

    let run = tokio::spawn(async move {
        state
            .newsletter
            .run_exclusive(&state.run_guard, state.subscribers.as_ref(), &options)
            .await
    });

    let report = run
        .await
        .map_err(|e| AppError::Internal(format!("newsletter run aborted: {e}")))??;

    Ok(Json(report))
}

/// GET /api/newsletter/preview - compose and render without sending
pub async fn preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PreviewQuery>,
) -> Result<impl IntoResponse, AppError> {
    verify_admin(&state, &headers)?;

    let email = match query.email {
        Some(e) => normalize_email(&e)?,
        None => "preview@example.com".to_string(),
    };

    let issue = state.newsletter.compose().await?;
    let rendered = state.newsletter.render_for(&issue, &email)?;

    Ok((StatusCode::OK, Html(rendered.html)))
}

/// GET /api/newsletter/status
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    verify_admin(&state, &headers)?;

    let webhook = state.webhook.load().await?;
    let schedule = state
        .config
        .schedule
        .as_deref()
        .and_then(|expr| Schedule::parse(expr).ok());

    Ok(Json(StatusResponse {
        running: state.run_guard.is_running(),
        backend: state.subscribers.backend().to_string(),
        mailer: state.newsletter.mailer_kind().to_string(),
        news_configured: state.newsletter.news_configured(),
        schedule: schedule.as_ref().map(|s| s.to_string()),
        next_run: schedule.and_then(|s| s.next_after(Utc::now())),
        webhook_enabled: webhook.enabled,
        last_triggered: webhook.last_triggered,
    }))
}
