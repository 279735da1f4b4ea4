/**
 * Summarizer
 * Turns articles into short newsletter blurbs through a chat-completion API.
 */
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::news::Article;
use super::{http_client, NewsletterError};
use crate::config::LlmConfig;

pub const PLACEHOLDER_SUMMARY: &str =
    "A summary is not available for this story. Follow the link to read it at the source.";

pub const PLACEHOLDER_INTRODUCTION: &str =
    "Here are the AI stories worth your attention this time.";

const SYSTEM_PROMPT: &str = "You write a concise, neutral AI news newsletter. \
    Answer in plain text without markdown, headings or lists.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Two or three sentence summary of one article
    async fn summarize(&self, article: &Article) -> Result<String, NewsletterError>;

    /// Short opening paragraph covering the whole issue
    async fn introduction(&self, articles: &[Article]) -> Result<String, NewsletterError>;
}

/// Summarize, substituting the description or a placeholder on any failure.
pub async fn summarize_or_fallback(summarizer: &dyn Summarizer, article: &Article) -> String {
    match summarizer.summarize(article).await {
        Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
        Ok(_) => fallback_summary(article),
        Err(e) => {
            tracing::warn!(url = %article.url, error = %e, "summary failed, using fallback");
            fallback_summary(article)
        }
    }
}

pub async fn introduction_or_fallback(summarizer: &dyn Summarizer, articles: &[Article]) -> String {
    match summarizer.introduction(articles).await {
        Ok(intro) if !intro.trim().is_empty() => intro.trim().to_string(),
        Ok(_) => PLACEHOLDER_INTRODUCTION.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "introduction failed, using fallback");
            PLACEHOLDER_INTRODUCTION.to_string()
        }
    }
}

fn fallback_summary(article: &Article) -> String {
    article
        .description
        .clone()
        .unwrap_or_else(|| PLACEHOLDER_SUMMARY.to_string())
}

// ============================================================================
// Chat-completion implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct ChatSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatSummarizer {
    pub fn from_config(config: &LlmConfig) -> Result<Self, NewsletterError> {
        Ok(Self {
            client: http_client(Duration::from_secs(config.timeout_secs))?,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, NewsletterError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(NewsletterError::NotConfigured("LLM_API_KEY"))?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NewsletterError::upstream("llm", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NewsletterError::UpstreamStatus {
                service: "llm",
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| NewsletterError::upstream("llm", e))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(NewsletterError::EmptyCompletion)
    }
}

fn article_prompt(article: &Article) -> String {
    let mut prompt = format!(
        "Summarize this AI news story in two or three sentences for a newsletter.\n\nTitle: {}\n",
        article.title
    );
    if let Some(source) = &article.source {
        prompt.push_str(&format!("Source: {}\n", source));
    }
    if let Some(description) = &article.description {
        prompt.push_str(&format!("Description: {}\n", description));
    }
    prompt.push_str(&format!("URL: {}\n", article.url));
    prompt
}

fn introduction_prompt(articles: &[Article]) -> String {
    let headlines: Vec<String> = articles.iter().map(|a| format!("- {}", a.title)).collect();
    format!(
        "Write a two sentence opening for today's AI newsletter covering these headlines:\n{}",
        headlines.join("\n")
    )
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, article: &Article) -> Result<String, NewsletterError> {
        self.complete(article_prompt(article)).await
    }

    async fn introduction(&self, articles: &[Article]) -> Result<String, NewsletterError> {
        self.complete(introduction_prompt(articles)).await
    }
}
