/*!
 * Application Configuration
 * Everything is read from environment variables (a `.env` file is loaded
 * first by the binaries). External API credentials have no defaults.
 */
use std::path::PathBuf;
use std::str::FromStr;

use crate::db::DbConfig;

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_string(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// News search endpoint settings
#[derive(Debug, Clone)]
pub struct NewsConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub query: String,
    pub language: String,
    /// How far back to search, in hours
    pub lookback_hours: i64,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl NewsConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_string("NEWS_API_URL"),
            api_key: env_string("NEWS_API_KEY"),
            query: env_or(
                "NEWS_QUERY",
                "\"artificial intelligence\" OR \"machine learning\" OR LLM",
            ),
            language: env_or("NEWS_LANGUAGE", "en"),
            lookback_hours: env_parse("NEWS_LOOKBACK_HOURS", 24),
            page_size: env_parse("NEWS_PAGE_SIZE", 30),
            timeout_secs: env_parse("NEWS_TIMEOUT_SECS", 15),
        }
    }
}

/// Chat-completion endpoint used for summaries
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("LLM_API_BASE", "https://api.openai.com/v1"),
            api_key: env_string("LLM_API_KEY"),
            model: env_or("LLM_MODEL", "gpt-4o-mini"),
            temperature: env_parse("LLM_TEMPERATURE", 0.3),
            max_tokens: env_parse("LLM_MAX_TOKENS", 220),
            timeout_secs: env_parse("LLM_TIMEOUT_SECS", 30),
        }
    }
}

/// Transactional mail API settings
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// When unset, messages are only logged
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
    pub reply_to: Option<String>,
    pub timeout_secs: u64,
}

impl MailConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_string("MAIL_API_URL"),
            api_key: env_string("MAIL_API_KEY"),
            from: env_or("MAIL_FROM", "AI Briefing <newsletter@localhost>"),
            reply_to: env_string("MAIL_REPLY_TO"),
            timeout_secs: env_parse("MAIL_TIMEOUT_SECS", 15),
        }
    }
}

/// Content settings for each issue
#[derive(Debug, Clone)]
pub struct NewsletterSettings {
    pub title: String,
    pub subject_prefix: String,
    pub max_articles: usize,
}

impl NewsletterSettings {
    pub fn from_env() -> Self {
        Self {
            title: env_or("NEWSLETTER_TITLE", "AI Briefing"),
            subject_prefix: env_or("NEWSLETTER_SUBJECT_PREFIX", "AI Briefing"),
            max_articles: env_parse("NEWSLETTER_MAX_ARTICLES", 5),
        }
    }
}

impl Default for NewsletterSettings {
    fn default() -> Self {
        Self {
            title: "AI Briefing".to_string(),
            subject_prefix: "AI Briefing".to_string(),
            max_articles: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub site_url: String,
    pub subscribers_file: PathBuf,
    pub webhook_file: PathBuf,
    /// Bearer token for the admin endpoints; admin routes are closed when unset
    pub admin_token: Option<String>,
    pub unsubscribe_secret: String,
    /// Cron expression; the scheduler is disabled when unset
    pub schedule: Option<String>,
    pub db: DbConfig,
    pub news: NewsConfig,
    pub llm: LlmConfig,
    pub mail: MailConfig,
    pub newsletter: NewsletterSettings,
}

pub const DEFAULT_UNSUBSCRIBE_SECRET: &str = "default-unsubscribe-secret-change-in-production";

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            environment: env_or("ENVIRONMENT", "development"),
            site_url: env_or("SITE_URL", "http://localhost:3001")
                .trim_end_matches('/')
                .to_string(),
            subscribers_file: PathBuf::from(env_or("SUBSCRIBERS_FILE", "data/subscribers.json")),
            webhook_file: PathBuf::from(env_or("WEBHOOK_CONFIG_FILE", "data/webhook-config.json")),
            admin_token: env_string("ADMIN_TOKEN"),
            unsubscribe_secret: env_or("UNSUBSCRIBE_SECRET", DEFAULT_UNSUBSCRIBE_SECRET),
            schedule: env_string("NEWSLETTER_CRON"),
            db: DbConfig::default(),
            news: NewsConfig::from_env(),
            llm: LlmConfig::from_env(),
            mail: MailConfig::from_env(),
            newsletter: NewsletterSettings::from_env(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn database_configured(&self) -> bool {
        self.db.url.is_some()
    }
}
