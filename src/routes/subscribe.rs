/**
 * Subscription Routes
 * Public subscribe / unsubscribe endpoints
 */
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;
use crate::subscribers::{normalize_email, SubscribeOutcome, UnsubscribeOutcome};
use crate::unsubscribe::verify_token;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub success: bool,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeLinkQuery {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub token: String,
}

fn outcome_name<T: Serialize>(outcome: T) -> String {
    serde_json::to_value(outcome)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email = normalize_email(&payload.email)?;
    let outcome = state.subscribers.subscribe(&email).await?;

    tracing::info!(email = %email, outcome = ?outcome, "subscribe request");

    let (status, message) = match outcome {
        SubscribeOutcome::Created => (StatusCode::CREATED, "Subscribed successfully"),
        SubscribeOutcome::Resubscribed => (StatusCode::CREATED, "Welcome back, you are subscribed again"),
        SubscribeOutcome::AlreadySubscribed => (StatusCode::OK, "Already subscribed"),
    };

    Ok((
        status,
        Json(SubscribeResponse {
            success: true,
            status: outcome_name(outcome),
            message: message.to_string(),
        }),
    ))
}

/// POST /api/unsubscribe - idempotent; unknown addresses also succeed
pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email = normalize_email(&payload.email)?;
    let outcome = state.subscribers.unsubscribe(&email).await?;

    tracing::info!(email = %email, outcome = ?outcome, "unsubscribe request");

    Ok((
        StatusCode::OK,
        Json(SubscribeResponse {
            success: true,
            status: outcome_name(outcome),
            message: "You have been unsubscribed".to_string(),
        }),
    ))
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family:sans-serif;max-width:32rem;margin:4rem auto;\">\
         <h1>{title}</h1><p>{body}</p></body></html>"
    ))
}

/// GET /api/unsubscribe?email=..&token=.. - target of the link in every email
pub async fn unsubscribe_link(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeLinkQuery>,
) -> Result<impl IntoResponse, AppError> {
    let invalid = || {
        (
            StatusCode::BAD_REQUEST,
            page("Invalid link", "This unsubscribe link is invalid or has been altered."),
        )
    };

    let Ok(email) = normalize_email(&query.email) else {
        return Ok(invalid());
    };
    if !verify_token(&state.config.unsubscribe_secret, &email, &query.token) {
        tracing::warn!(email = %email, "unsubscribe link with bad token");
        return Ok(invalid());
    }

    let outcome = state.subscribers.unsubscribe(&email).await?;
    tracing::info!(email = %email, outcome = ?outcome, "unsubscribe via link");

    let body = match outcome {
        UnsubscribeOutcome::Unsubscribed => "You will no longer receive the newsletter.",
        UnsubscribeOutcome::AlreadyUnsubscribed | UnsubscribeOutcome::NotFound => {
            "This address is not subscribed."
        }
    };

    Ok((StatusCode::OK, page("Unsubscribed", body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newsletter::tests::{test_config, EchoSummarizer, FakeNews, RecordingMailer};
    use crate::newsletter::Newsletter;
    use crate::subscribers::json_file::tests::temp_path;
    use crate::subscribers::JsonFileStore;
    use crate::subscribers::json_file::tests::write_raw;
    use crate::unsubscribe::{unsubscribe_token, unsubscribe_url};
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, post};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        state_with_store(JsonFileStore::new(temp_path()))
    }

    fn state_with_store(store: JsonFileStore) -> AppState {
        let config = test_config();
        let newsletter = Newsletter::new(
            Some(Arc::new(FakeNews(vec![]))),
            Arc::new(EchoSummarizer { fail: false }),
            Arc::new(RecordingMailer::default()),
            &config,
        )
        .unwrap();
        AppState::new(config, Arc::new(store), newsletter)
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/subscribe", post(subscribe))
            .route("/api/unsubscribe", post(unsubscribe).get(unsubscribe_link))
            .with_state(state)
    }

    async fn post_json(app: Router, uri: &str, json: &impl Serialize) -> (StatusCode, Vec<u8>) {
        let req = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(json).unwrap()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn email(e: &str) -> EmailRequest {
        EmailRequest {
            email: e.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_duplicate() {
        let state = test_state();

        let (status, body) = post_json(router(state.clone()), "/api/subscribe", &email("New@Example.com")).await;
        assert_eq!(status, StatusCode::CREATED);
        let body: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.status, "created");

        let (status, body) = post_json(router(state.clone()), "/api/subscribe", &email("new@example.com")).await;
        assert_eq!(status, StatusCode::OK);
        let body: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert!(body.success);
        assert_eq!(body.status, "already_subscribed");

        assert_eq!(state.subscribers.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_invalid_email_is_bad_request() {
        let (status, _) = post_json(router(test_state()), "/api/subscribe", &email("nope")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_subscribe_missing_email_is_bad_request() {
        let (status, _) = post_json(router(test_state()), "/api/subscribe", &serde_json::json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let state = test_state();
        state.subscribers.subscribe("a@example.com").await.unwrap();

        for expected in ["unsubscribed", "already_unsubscribed"] {
            let (status, body) = post_json(router(state.clone()), "/api/unsubscribe", &email("a@example.com")).await;
            assert_eq!(status, StatusCode::OK);
            let body: SubscribeResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(body.status, expected);
        }

        let (status, _) = post_json(router(state), "/api/unsubscribe", &email("ghost@example.com")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unsubscribe_link_requires_valid_token() {
        let state = test_state();
        state.subscribers.subscribe("a@example.com").await.unwrap();

        let bad = Request::get("/api/unsubscribe?email=a%40example.com&token=deadbeef")
            .body(Body::empty())
            .unwrap();
        let res = router(state.clone()).oneshot(bad).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(state.subscribers.get("a@example.com").await.unwrap().unwrap().subscribed);

        let token = unsubscribe_token("test-secret", "a@example.com");
        let good = Request::get(format!("/api/unsubscribe?email=a%40example.com&token={token}"))
            .body(Body::empty())
            .unwrap();
        let res = router(state.clone()).oneshot(good).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!state.subscribers.get("a@example.com").await.unwrap().unwrap().subscribed);
    }

    #[tokio::test]
    async fn test_emailed_link_unsubscribes_legacy_mixed_case_record() {
        let path = temp_path();
        write_raw(
            &path,
            r#"[{"email":"Reader@Example.com","subscribed":true,"subscribedAt":"2024-05-01T08:00:00Z"}]"#,
        )
        .await;
        let state = state_with_store(JsonFileStore::new(path));

        let link = unsubscribe_url("https://site.example", "test-secret", "reader@example.com");
        let uri = link.trim_start_matches("https://site.example");
        let res = router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let list = state.subscribers.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].subscribed);

        let (status, body) =
            post_json(router(state.clone()), "/api/subscribe", &email("Reader@Example.com")).await;
        assert_eq!(status, StatusCode::CREATED);
        let body: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.status, "resubscribed");
        assert_eq!(state.subscribers.list().await.unwrap().len(), 1);
    }
}
