/**
 * Health Routes
 * Endpoints for checking backend health status
 */
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::state::AppState;

// Track server start time for uptime calculation
lazy_static::lazy_static! {
    static ref SERVER_START: Instant = Instant::now();
}

/// Initialize the server start time
pub fn init_start_time() {
    lazy_static::initialize(&SERVER_START);
}

/// Single service check result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCheck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceCheck {
    fn healthy(response_time: Option<u64>, detail: Option<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            response_time,
            detail,
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            response_time: None,
            detail: None,
            error: Some(error),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Detailed health check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    pub checks: HealthChecks,
}

/// Health checks for all services
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: ServiceCheck,
    pub subscribers: ServiceCheck,
    pub mailer: ServiceCheck,
}

/// Ready check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Simple health response
#[derive(Debug, Serialize, Deserialize)]
pub struct SimpleHealthResponse {
    pub status: String,
}

async fn database_check() -> ServiceCheck {
    match crate::db::health_check().await {
        Ok(duration) => ServiceCheck::healthy(Some(duration.as_millis() as u64), None),
        Err(e) => ServiceCheck::unhealthy(e.to_string()),
    }
}

async fn subscribers_check(state: &AppState) -> ServiceCheck {
    let start = Instant::now();
    match state.subscribers.list().await {
        Ok(_) => ServiceCheck::healthy(
            Some(start.elapsed().as_millis() as u64),
            Some(state.subscribers.backend().to_string()),
        ),
        Err(e) => ServiceCheck::unhealthy(e.to_string()),
    }
}

/// GET /health - Simple health ping
pub async fn health_ping() -> impl IntoResponse {
    Json(SimpleHealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /health/detailed - Detailed health with all checks
pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = SERVER_START.elapsed().as_secs();

    // The database is optional (JSON file fallback), so it never fails the
    // overall status on its own.
    let database = database_check().await;
    let subscribers = subscribers_check(&state).await;
    let mailer = ServiceCheck::healthy(None, Some(state.newsletter.mailer_kind().to_string()));

    let overall_status = if subscribers.is_healthy() { "ok" } else { "degraded" };

    let response = DetailedHealthResponse {
        status: overall_status.to_string(),
        timestamp: Utc::now(),
        uptime: Some(uptime),
        checks: HealthChecks {
            database,
            subscribers,
            mailer,
        },
    };

    (StatusCode::OK, Json(response))
}

/// GET /health/database - Database health check
pub async fn health_database() -> impl IntoResponse {
    (StatusCode::OK, Json(database_check().await))
}

/// GET /health/ready - Readiness check
pub async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = SERVER_START.elapsed().as_secs();
    let subscribers = subscribers_check(&state).await;

    let (status, body) = if subscribers.is_healthy() {
        (
            StatusCode::OK,
            ReadyResponse {
                status: "ready".to_string(),
                timestamp: Utc::now(),
                uptime: Some(uptime),
                reason: None,
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            ReadyResponse {
                status: "not ready".to_string(),
                timestamp: Utc::now(),
                uptime: Some(uptime),
                reason: subscribers.error,
            },
        )
    };

    (status, Json(body))
}
