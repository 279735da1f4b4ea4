/**
 * News Source
 * Fetches recent articles from a search endpoint returning
 * `{ "articles": [{ title, description, url, source: { name }, publishedAt }] }`.
 */
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{http_client, NewsletterError};
use crate::config::NewsConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewsQuery {
    pub query: String,
    pub language: String,
    pub since: DateTime<Utc>,
    pub page_size: u32,
}

impl NewsQuery {
    pub fn from_config(config: &NewsConfig, now: DateTime<Utc>) -> Self {
        Self {
            query: config.query.clone(),
            language: config.language.clone(),
            since: now - chrono::Duration::hours(config.lookback_hours.max(1)),
            page_size: config.page_size.clamp(1, 100),
        }
    }
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch(&self, query: &NewsQuery) -> Result<Vec<Article>, NewsletterError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    articles: Vec<RawArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArticle {
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    source: Option<RawSource>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    name: Option<String>,
}

impl RawArticle {
    fn into_article(self) -> Option<Article> {
        let title = self.title?.trim().to_string();
        let url = self.url?.trim().to_string();
        Some(Article {
            title,
            description: self
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            url,
            source: self.source.and_then(|s| s.name),
            published_at: self.published_at,
        })
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpNewsSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpNewsSource {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NewsletterError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            api_key,
        })
    }

    /// `Ok(None)` when no search endpoint is configured.
    pub fn from_config(config: &NewsConfig) -> Result<Option<Self>, NewsletterError> {
        config
            .api_url
            .as_ref()
            .map(|url| {
                Self::new(
                    url.clone(),
                    config.api_key.clone(),
                    Duration::from_secs(config.timeout_secs),
                )
            })
            .transpose()
    }
}

#[async_trait]
impl NewsSource for HttpNewsSource {
    async fn fetch(&self, query: &NewsQuery) -> Result<Vec<Article>, NewsletterError> {
        let since = query.since.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let page_size = query.page_size.to_string();

        let mut request = self.client.get(&self.url).query(&[
            ("q", query.query.as_str()),
            ("from", since.as_str()),
            ("language", query.language.as_str()),
            ("sortBy", "publishedAt"),
            ("pageSize", page_size.as_str()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "news request failed");
            NewsletterError::upstream("news", e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "news upstream returned error");
            return Err(NewsletterError::UpstreamStatus {
                service: "news",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| NewsletterError::upstream("news", e))?;

        let articles: Vec<Article> = parsed
            .articles
            .into_iter()
            .filter_map(RawArticle::into_article)
            .collect();
        tracing::info!(count = articles.len(), "fetched news articles");
        Ok(articles)
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Drop unusable entries, de-duplicate by URL and title, keep the first `max`.
pub fn select_articles(articles: Vec<Article>, max: usize) -> Vec<Article> {
    let mut seen_urls = HashSet::new();
    let mut seen_titles = HashSet::new();

    articles
        .into_iter()
        .filter(|a| !a.title.is_empty() && !a.url.is_empty())
        .filter(|a| a.title != "[Removed]" && a.url.starts_with("http"))
        .filter(|a| seen_urls.insert(a.url.trim_end_matches('/').to_string()))
        .filter(|a| seen_titles.insert(a.title.to_lowercase()))
        .take(max)
        .collect()
}
