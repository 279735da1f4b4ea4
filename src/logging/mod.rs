/*!
 * Logging Module
 * Centralized tracing setup shared by the server and the CLI
 */
pub mod middleware;

use std::io;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Console plus rolling files under `logs/`
    Server,
    /// Console only, on stderr so command output stays clean
    Cli,
}

/// Keeps the background writer threads alive; drop it only at exit.
#[must_use = "dropping the guards stops the log writers"]
pub struct LogGuards(#[allow(dead_code)] Vec<WorkerGuard>);

fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "newsletter_backend={level},newsletter={level},tower_http=debug,axum=debug"
        ))
    })
}

/// Initialize the logging system
pub fn init(target: LogTarget) -> LogGuards {
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let is_production = environment == "production";

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if is_production || target == LogTarget::Cli {
            "info".to_string()
        } else {
            "debug".to_string()
        }
    });

    let subscriber = tracing_subscriber::registry().with(default_filter(&log_level));

    if target == LogTarget::Cli {
        let (console_writer, console_guard) = non_blocking(io::stderr());
        subscriber
            .with(fmt::layer().with_writer(console_writer).with_target(false))
            .init();
        return LogGuards(vec![console_guard]);
    }

    std::fs::create_dir_all("logs").ok();

    let (file_writer, file_guard) = non_blocking(rolling::daily("logs", "app.log"));
    let (console_writer, console_guard) = non_blocking(io::stdout());

    if is_production {
        let (error_writer, error_guard) = non_blocking(rolling::daily("logs", "error.log"));

        // JSON format for production
        let file_layer = fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        let error_layer = fmt::layer()
            .json()
            .with_writer(error_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

        let console_layer = fmt::layer()
            .json()
            .with_writer(console_writer)
            .with_target(false);

        subscriber
            .with(file_layer)
            .with(error_layer)
            .with(console_layer)
            .init();

        tracing::info!("Logging initialized for {} environment", environment);
        LogGuards(vec![file_guard, error_guard, console_guard])
    } else {
        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);

        let console_layer = fmt::layer()
            .with_writer(console_writer)
            .with_target(true)
            .pretty();

        subscriber.with(file_layer).with(console_layer).init();

        tracing::info!("Logging initialized for {} environment", environment);
        LogGuards(vec![file_guard, console_guard])
    }
}
