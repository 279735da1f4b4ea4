use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::newsletter::NewsletterError;
use crate::routes::ErrorResponse;
use crate::subscribers::StoreError;
use crate::webhook::WebhookError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Newsletter(#[from] NewsletterError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            AppError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(m) => {
                tracing::error!("Internal error: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Store(StoreError::InvalidEmail(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid email address".to_string())
            }
            AppError::Store(e) => {
                tracing::error!("Subscriber storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            AppError::Newsletter(e) => match e {
                NewsletterError::AlreadyRunning => (StatusCode::CONFLICT, e.to_string()),
                NewsletterError::NoNews => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
                NewsletterError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                NewsletterError::Upstream { .. }
                | NewsletterError::UpstreamStatus { .. }
                | NewsletterError::EmptyCompletion => {
                    tracing::error!("Newsletter upstream error: {}", e);
                    (StatusCode::BAD_GATEWAY, "Upstream service failed".to_string())
                }
                NewsletterError::Store(StoreError::InvalidEmail(_)) => {
                    (StatusCode::BAD_REQUEST, "Invalid email address".to_string())
                }
                NewsletterError::Template(_)
                | NewsletterError::Store(_)
                | NewsletterError::HttpClient(_) => {
                    tracing::error!("Newsletter error: {}", e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Newsletter run failed".to_string())
                }
            },
            AppError::Webhook(e) => {
                tracing::error!("Webhook config error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Webhook configuration error".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_message();
        (status, Json(ErrorResponse { error, message: None })).into_response()
    }
}
