//! Newsletter Backend - portfolio API with an AI news newsletter pipeline

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod newsletter;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod subscribers;
pub mod unsubscribe;
pub mod webhook;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
};

use crate::config::{AppConfig, DEFAULT_UNSUBSCRIBE_SECRET};
use crate::scheduler::Schedule;
use crate::state::AppState;

/// Configure CORS from environment variables.
/// Uses ALLOWED_ORIGINS (comma-separated) or FRONTEND_ORIGIN.
/// Falls back to the local dev front-end.
pub fn configure_cors() -> CorsLayer {
    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .and_then(|s| {
            let origins: Vec<HeaderValue> = s
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                None
            } else {
                Some(origins)
            }
        })
        .or_else(|| {
            std::env::var("FRONTEND_ORIGIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(|origin| vec![origin])
        })
        .unwrap_or_else(|| {
            vec![
                HeaderValue::from_static("http://localhost:3000"),
                HeaderValue::from_static("http://127.0.0.1:3000"),
            ]
        });

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .allow_credentials(true)
}

/// Create and configure the application router.
pub fn create_app(state: AppState) -> Router {
    let cors = configure_cors();
    tracing::info!("CORS configured");

    Router::new()
        .route("/api/subscribe", post(routes::subscribe::subscribe))
        .route(
            "/api/unsubscribe",
            post(routes::subscribe::unsubscribe).get(routes::subscribe::unsubscribe_link),
        )
        .route("/api/newsletter/webhook", post(routes::webhook::trigger))
        .route(
            "/api/newsletter/subscribers",
            get(routes::admin::list_subscribers),
        )
        .route("/api/newsletter/send", post(routes::admin::send_now))
        .route("/api/newsletter/preview", get(routes::admin::preview))
        .route("/api/newsletter/status", get(routes::admin::status))
        .route("/health", get(routes::health::health_ping))
        .route("/health/detailed", get(routes::health::health_detailed))
        .route("/health/database", get(routes::health::health_database))
        .route("/health/ready", get(routes::health::health_ready))
        .with_state(state)
        .layer(logging::middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(logging::middleware::log_request))
        .layer(logging::middleware::request_id_layer())
        .layer(TraceLayer::new_for_http().make_span_with(logging::middleware::PathOnlySpan))
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(cors)
}

/// Refuse to start in production with the default unsubscribe secret.
fn check_production_config(config: &AppConfig) {
    if !config.is_production() {
        return;
    }

    if config.unsubscribe_secret == DEFAULT_UNSUBSCRIBE_SECRET {
        panic!(
            "FATAL: UNSUBSCRIBE_SECRET must be set to a secure, unique value in production. \
             Refusing to start with the default secret."
        );
    }

    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN is not set. Admin newsletter endpoints are disabled.");
    }
    if config.mail.api_url.is_none() {
        tracing::warn!("MAIL_API_URL is not set. Newsletters will only be logged.");
    }
}

/// Run the server (used by main).
pub async fn run() {
    dotenvy::dotenv().ok();

    // Held until exit; dropping them stops the log writers.
    let _log_guards = logging::init(logging::LogTarget::Server);

    routes::health::init_start_time();

    let config = AppConfig::from_env();
    check_production_config(&config);

    let schedule = config.schedule.as_deref().map(Schedule::parse);

    let state = AppState::from_config(config)
        .await
        .expect("Failed to build newsletter pipeline");

    match schedule {
        Some(Ok(schedule)) => {
            scheduler::spawn(state.clone(), schedule);
        }
        Some(Err(e)) => {
            tracing::error!("Invalid NEWSLETTER_CRON expression, scheduler disabled: {}", e);
        }
        None => tracing::info!("NEWSLETTER_CRON not set. Scheduler disabled."),
    }

    let app = create_app(state);

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3001);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid HOST/PORT configuration");
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newsletter::tests::{test_config, EchoSummarizer, FakeNews, RecordingMailer};
    use crate::newsletter::Newsletter;
    use crate::subscribers::json_file::tests::temp_path;
    use crate::subscribers::JsonFileStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = test_config();
        let newsletter = Newsletter::new(
            Some(Arc::new(FakeNews(vec![]))),
            Arc::new(EchoSummarizer { fail: false }),
            Arc::new(RecordingMailer::default()),
            &config,
        )
        .unwrap();
        AppState::new(config, Arc::new(JsonFileStore::new(temp_path())), newsletter)
    }

    #[tokio::test]
    async fn test_create_app_serves_health_with_request_id() {
        let app = create_app(test_state());
        let res = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_create_app_routes_subscribe() {
        let app = create_app(test_state());
        let req = Request::post("/api/subscribe")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"email":"reader@example.com"}"#))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_production_check_ignores_development() {
        let mut config = test_config();
        config.environment = "development".to_string();
        config.unsubscribe_secret = DEFAULT_UNSUBSCRIBE_SECRET.to_string();
        check_production_config(&config);
    }

    #[test]
    #[should_panic(expected = "UNSUBSCRIBE_SECRET")]
    fn test_production_check_rejects_default_secret() {
        let mut config = test_config();
        config.environment = "production".to_string();
        config.unsubscribe_secret = DEFAULT_UNSUBSCRIBE_SECRET.to_string();
        check_production_config(&config);
    }
}
