/*!
 * Newsletter Pipeline
 * news fetch -> summarization -> templating -> delivery -> lastEmailSent
 */
pub mod mailer;
pub mod news;
pub mod summarize;
pub mod template;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::config::{AppConfig, NewsConfig, NewsletterSettings};
use crate::subscribers::{canonical_email, StoreError, SubscriberStore};
use crate::unsubscribe::unsubscribe_url;
use mailer::{Mailer, OutgoingEmail};
use news::{select_articles, HttpNewsSource, NewsQuery, NewsSource};
use summarize::{introduction_or_fallback, summarize_or_fallback, ChatSummarizer, Summarizer};
use template::{issue_subject, Issue, RenderedEmail, Renderer, Story};

#[derive(Debug, Error)]
pub enum NewsletterError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{service} request failed: {source}")]
    Upstream {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}")]
    UpstreamStatus {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("language model returned no choices")]
    EmptyCompletion,

    #[error("no news articles found for this issue")]
    NoNews,

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("a newsletter run is already in progress")]
    AlreadyRunning,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl NewsletterError {
    pub(crate) fn upstream(service: &'static str, source: reqwest::Error) -> Self {
        Self::Upstream { service, source }
    }
}

/// Client shared by the upstream integrations; every request is bounded by `timeout`.
pub(crate) fn http_client(
    timeout: std::time::Duration,
) -> Result<reqwest::Client, NewsletterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(NewsletterError::HttpClient)
}

// ============================================================================
// Options and reports
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    /// Render everything but send and record nothing
    #[serde(default)]
    pub dry_run: bool,
    /// Send to at most this many active subscribers
    pub limit: Option<usize>,
    /// Send only to this address (test sends), bypassing the subscriber list
    pub only: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub email: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: Vec<FailedDelivery>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub subject: String,
    pub stories: usize,
    pub delivery: DeliveryReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Single-flight guard shared by every trigger in the process
#[derive(Clone, Default)]
pub struct RunGuard {
    lock: Arc<Mutex<()>>,
}

impl RunGuard {
    pub fn try_start(&self) -> Result<OwnedMutexGuard<()>, NewsletterError> {
        self.lock
            .clone()
            .try_lock_owned()
            .map_err(|_| NewsletterError::AlreadyRunning)
    }

    pub fn is_running(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Sender identity and link settings
#[derive(Debug, Clone)]
pub struct Sender {
    pub from: String,
    pub reply_to: Option<String>,
    pub site_url: String,
    pub unsubscribe_secret: String,
}

impl Sender {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            from: config.mail.from.clone(),
            reply_to: config.mail.reply_to.clone(),
            site_url: config.site_url.clone(),
            unsubscribe_secret: config.unsubscribe_secret.clone(),
        }
    }
}

pub struct Newsletter {
    news: Option<Arc<dyn NewsSource>>,
    summarizer: Arc<dyn Summarizer>,
    mailer: Arc<dyn Mailer>,
    renderer: Renderer,
    news_config: NewsConfig,
    settings: NewsletterSettings,
    sender: Sender,
}

impl Newsletter {
    pub fn new(
        news: Option<Arc<dyn NewsSource>>,
        summarizer: Arc<dyn Summarizer>,
        mailer: Arc<dyn Mailer>,
        config: &AppConfig,
    ) -> Result<Self, NewsletterError> {
        Ok(Self {
            news,
            summarizer,
            mailer,
            renderer: Renderer::new(config.site_url.clone())?,
            news_config: config.news.clone(),
            settings: config.newsletter.clone(),
            sender: Sender::from_config(config),
        })
    }

    /// Wire the HTTP-backed collaborators described by the configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, NewsletterError> {
        let news = HttpNewsSource::from_config(&config.news)?
            .map(|source| Arc::new(source) as Arc<dyn NewsSource>);
        if news.is_none() {
            tracing::warn!("NEWS_API_URL not set. Newsletter runs will fail until it is configured.");
        }

        Self::new(
            news,
            Arc::new(ChatSummarizer::from_config(&config.llm)?),
            Arc::from(mailer::from_config(&config.mail)?),
            config,
        )
    }

    pub fn mailer_kind(&self) -> &'static str {
        self.mailer.kind()
    }

    pub fn news_configured(&self) -> bool {
        self.news.is_some()
    }

    /// Fetch, select and summarize the stories of a new issue.
    pub async fn compose(&self) -> Result<Issue, NewsletterError> {
        let now = Utc::now();
        let news = self
            .news
            .as_ref()
            .ok_or(NewsletterError::NotConfigured("NEWS_API_URL"))?;

        let query = NewsQuery::from_config(&self.news_config, now);
        let articles = select_articles(news.fetch(&query).await?, self.settings.max_articles);
        if articles.is_empty() {
            tracing::warn!("no usable news articles, nothing to send");
            return Err(NewsletterError::NoNews);
        }

        let introduction = introduction_or_fallback(self.summarizer.as_ref(), &articles).await;

        let mut stories = Vec::with_capacity(articles.len());
        for article in &articles {
            let summary = summarize_or_fallback(self.summarizer.as_ref(), article).await;
            stories.push(Story {
                title: article.title.clone(),
                url: article.url.clone(),
                source: article.source.clone(),
                summary,
            });
        }

        tracing::info!(stories = stories.len(), "composed newsletter issue");

        Ok(Issue {
            title: self.settings.title.clone(),
            subject: issue_subject(&self.settings.subject_prefix, &now),
            date: now,
            introduction,
            stories,
        })
    }

    /// Render the issue as a given recipient would receive it.
    pub fn render_for(&self, issue: &Issue, email: &str) -> Result<RenderedEmail, NewsletterError> {
        let url = self.unsubscribe_link(email);
        self.renderer.render(issue, email, &url)
    }

    fn unsubscribe_link(&self, email: &str) -> String {
        unsubscribe_url(
            &self.sender.site_url,
            &self.sender.unsubscribe_secret,
            email,
        )
    }

    /// Send the issue to every active subscriber, one at a time.
    pub async fn deliver(
        &self,
        issue: &Issue,
        store: &dyn SubscriberStore,
        options: &DeliveryOptions,
    ) -> Result<DeliveryReport, NewsletterError> {
        let recipients: Vec<String> = match &options.only {
            Some(email) => vec![canonical_email(email)],
            None => store
                .active()
                .await?
                .into_iter()
                .map(|s| canonical_email(&s.email))
                .take(options.limit.unwrap_or(usize::MAX))
                .collect(),
        };

        let mut report = DeliveryReport {
            recipients: recipients.len(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        for email in &recipients {
            let unsubscribe = self.unsubscribe_link(email);
            let rendered = self.renderer.render(issue, email, &unsubscribe)?;

            if options.dry_run {
                tracing::debug!(to = %email, "dry run, not sending");
                continue;
            }

            let outgoing = OutgoingEmail {
                from: self.sender.from.clone(),
                to: vec![email.clone()],
                subject: rendered.subject,
                html: rendered.html,
                text: rendered.text,
                reply_to: self.sender.reply_to.clone(),
                headers: Some(serde_json::json!({
                    "List-Unsubscribe": format!("<{}>", unsubscribe),
                })),
            };

            match self.mailer.send(&outgoing).await {
                Ok(()) => {
                    tracing::info!(to = %email, "newsletter sent");
                    report.delivered += 1;
                    // record each success before the next send
                    let sent = std::slice::from_ref(email);
                    if let Err(e) = store.mark_sent(sent, Utc::now()).await {
                        tracing::error!(to = %email, error = %e, "failed to record delivery");
                    }
                }
                Err(e) => {
                    tracing::error!(to = %email, error = %e, "newsletter delivery failed");
                    report.failed.push(FailedDelivery {
                        email: email.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Compose and deliver in one go.
    pub async fn run(
        &self,
        store: &dyn SubscriberStore,
        options: &DeliveryOptions,
    ) -> Result<RunReport, NewsletterError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            %run_id,
            dry_run = options.dry_run,
            backend = store.backend(),
            "newsletter run started"
        );

        let issue = self.compose().await?;
        let delivery = self.deliver(&issue, store, options).await?;

        let report = RunReport {
            run_id,
            subject: issue.subject,
            stories: issue.stories.len(),
            delivery,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            %run_id,
            recipients = report.delivery.recipients,
            delivered = report.delivery.delivered,
            failed = report.delivery.failed.len(),
            "newsletter run finished"
        );

        Ok(report)
    }

    /// `run`, but refused while another run holds the guard.
    pub async fn run_exclusive(
        &self,
        guard: &RunGuard,
        store: &dyn SubscriberStore,
        options: &DeliveryOptions,
    ) -> Result<RunReport, NewsletterError> {
        let _running = guard.try_start()?;
        self.run(store, options).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::subscribers::json_file::tests::temp_path;
    use crate::subscribers::JsonFileStore;
    use async_trait::async_trait;
    use news::Article;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct FakeNews(pub Vec<Article>);

    #[async_trait]
    impl NewsSource for FakeNews {
        async fn fetch(&self, _query: &NewsQuery) -> Result<Vec<Article>, NewsletterError> {
            Ok(self.0.clone())
        }
    }

    pub(crate) struct EchoSummarizer {
        pub fail: bool,
    }

    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, article: &Article) -> Result<String, NewsletterError> {
            if self.fail {
                return Err(NewsletterError::EmptyCompletion);
            }
            Ok(format!("About {}.", article.title))
        }

        async fn introduction(&self, articles: &[Article]) -> Result<String, NewsletterError> {
            if self.fail {
                return Err(NewsletterError::EmptyCompletion);
            }
            Ok(format!("{} stories today.", articles.len()))
        }
    }

    /// Records what it sends; refuses addresses listed in `reject`
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: StdMutex<Vec<OutgoingEmail>>,
        pub reject: Vec<String>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        fn kind(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, email: &OutgoingEmail) -> Result<(), NewsletterError> {
            if email.to.iter().any(|to| self.reject.contains(to)) {
                return Err(NewsletterError::UpstreamStatus {
                    service: "mail",
                    status: 422,
                    body: "rejected".to_string(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    /// Lets `permits` sends through, then blocks every later send
    pub(crate) struct GatedMailer {
        pub gate: tokio::sync::Semaphore,
        pub sent: StdMutex<Vec<String>>,
    }

    impl GatedMailer {
        pub(crate) fn new(permits: usize) -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(permits),
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Mailer for GatedMailer {
        fn kind(&self) -> &'static str {
            "gated"
        }

        async fn send(&self, email: &OutgoingEmail) -> Result<(), NewsletterError> {
            self.gate.acquire().await.unwrap().forget();
            self.sent.lock().unwrap().extend(email.to.iter().cloned());
            Ok(())
        }
    }

    pub(crate) fn article(n: usize) -> Article {
        Article {
            title: format!("Story {n}"),
            description: Some(format!("Description {n}")),
            url: format!("https://news.example/{n}"),
            source: Some("Wire".to_string()),
            published_at: None,
        }
    }

    pub(crate) fn test_config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.site_url = "https://site.example".to_string();
        config.unsubscribe_secret = "test-secret".to_string();
        config.newsletter = NewsletterSettings::default();
        config
    }

    fn newsletter(
        articles: Vec<Article>,
        fail_summaries: bool,
        mailer: Arc<RecordingMailer>,
    ) -> Newsletter {
        Newsletter::new(
            Some(Arc::new(FakeNews(articles))),
            Arc::new(EchoSummarizer {
                fail: fail_summaries,
            }),
            mailer,
            &test_config(),
        )
        .unwrap()
    }

    async fn store_with(emails: &[&str]) -> JsonFileStore {
        let store = JsonFileStore::new(temp_path());
        for email in emails {
            store.subscribe(email).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_compose_limits_and_summarizes() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter((1..=8).map(article).collect(), false, mailer);

        let issue = nl.compose().await.unwrap();
        assert_eq!(issue.stories.len(), 5);
        assert_eq!(issue.stories[0].summary, "About Story 1.");
        assert_eq!(issue.introduction, "5 stories today.");
        assert!(issue.subject.starts_with("AI Briefing | "));
    }

    #[tokio::test]
    async fn test_no_news_sends_nothing() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![], false, mailer.clone());
        let store = store_with(&["a@example.com"]).await;

        let result = nl.run(&store, &DeliveryOptions::default()).await;
        assert!(matches!(result, Err(NewsletterError::NoNews)));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_news_source_is_not_configured() {
        let nl = Newsletter::new(
            None,
            Arc::new(EchoSummarizer { fail: false }),
            Arc::new(RecordingMailer::default()),
            &test_config(),
        )
        .unwrap();
        assert!(matches!(
            nl.compose().await,
            Err(NewsletterError::NotConfigured("NEWS_API_URL"))
        ));
    }

    #[tokio::test]
    async fn test_summarizer_failure_still_sends_fallback_content() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], true, mailer.clone());
        let store = store_with(&["a@example.com"]).await;

        let report = nl.run(&store, &DeliveryOptions::default()).await.unwrap();
        assert_eq!(report.delivery.delivered, 1);

        let sent = mailer.sent.lock().unwrap();
        assert!(sent[0].text.contains("Description 1"));
        assert!(sent[0].text.contains(summarize::PLACEHOLDER_INTRODUCTION));
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_stop_others() {
        let mailer = Arc::new(RecordingMailer {
            reject: vec!["bad@example.com".to_string()],
            ..Default::default()
        });
        let nl = newsletter(vec![article(1)], false, mailer.clone());
        let store = store_with(&["good@example.com", "bad@example.com", "also@example.com"]).await;

        let report = nl.run(&store, &DeliveryOptions::default()).await.unwrap();
        assert_eq!(report.delivery.recipients, 3);
        assert_eq!(report.delivery.delivered, 2);
        assert_eq!(report.delivery.failed.len(), 1);
        assert_eq!(report.delivery.failed[0].email, "bad@example.com");

        let bad = store.get("bad@example.com").await.unwrap().unwrap();
        let good = store.get("good@example.com").await.unwrap().unwrap();
        assert!(bad.last_email_sent.is_none());
        assert!(good.last_email_sent.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribed_readers_are_skipped() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer.clone());
        let store = store_with(&["stay@example.com", "gone@example.com"]).await;
        store.unsubscribe("gone@example.com").await.unwrap();

        let report = nl.run(&store, &DeliveryOptions::default()).await.unwrap();
        assert_eq!(report.delivery.recipients, 1);
        assert_eq!(mailer.sent.lock().unwrap()[0].to, vec!["stay@example.com"]);
    }

    #[tokio::test]
    async fn test_dry_run_neither_sends_nor_records() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer.clone());
        let store = store_with(&["a@example.com"]).await;

        let options = DeliveryOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = nl.run(&store, &options).await.unwrap();
        assert!(report.delivery.dry_run);
        assert_eq!(report.delivery.recipients, 1);
        assert_eq!(report.delivery.delivered, 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
        assert!(store
            .get("a@example.com")
            .await
            .unwrap()
            .unwrap()
            .last_email_sent
            .is_none());
    }

    #[tokio::test]
    async fn test_limit_and_only_select_recipients() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer.clone());
        let store = store_with(&["a@example.com", "b@example.com", "c@example.com"]).await;
        let issue = nl.compose().await.unwrap();

        let limited = DeliveryOptions {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(nl.deliver(&issue, &store, &limited).await.unwrap().delivered, 2);

        let only = DeliveryOptions {
            only: Some("me@example.com".to_string()),
            ..Default::default()
        };
        let report = nl.deliver(&issue, &store, &only).await.unwrap();
        assert_eq!(report.recipients, 1);
        assert_eq!(mailer.sent.lock().unwrap().last().unwrap().to, vec!["me@example.com"]);
    }

    #[tokio::test]
    async fn test_sent_email_carries_unsubscribe_link() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer.clone());
        let store = store_with(&["a@example.com"]).await;

        nl.run(&store, &DeliveryOptions::default()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        let expected = unsubscribe_url("https://site.example", "test-secret", "a@example.com");
        assert!(sent[0].text.contains(&expected));
        assert_eq!(
            sent[0].headers.as_ref().unwrap()["List-Unsubscribe"],
            format!("<{}>", expected)
        );
    }

    #[tokio::test]
    async fn test_interrupted_run_keeps_record_of_sent_emails() {
        let mailer = Arc::new(GatedMailer::new(1));
        let nl = Newsletter::new(
            Some(Arc::new(FakeNews(vec![article(1)]))),
            Arc::new(EchoSummarizer { fail: false }),
            mailer.clone(),
            &test_config(),
        )
        .unwrap();
        let store = store_with(&["first@example.com", "second@example.com"]).await;

        let opts = DeliveryOptions::default();
        let run = nl.run(&store, &opts);
        let result = tokio::time::timeout(std::time::Duration::from_millis(300), run).await;
        assert!(result.is_err());

        assert_eq!(*mailer.sent.lock().unwrap(), vec!["first@example.com"]);
        let first = store.get("first@example.com").await.unwrap().unwrap();
        let second = store.get("second@example.com").await.unwrap().unwrap();
        assert!(first.last_email_sent.is_some());
        assert!(second.last_email_sent.is_none());
    }

    #[tokio::test]
    async fn test_legacy_mixed_case_recipient_gets_canonical_link() {
        let path = temp_path();
        crate::subscribers::json_file::tests::write_raw(
            &path,
            r#"[{"email":"Reader@Example.com","subscribed":true,"subscribedAt":"2024-05-01T08:00:00Z"}]"#,
        )
        .await;
        let store = JsonFileStore::new(path);
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer.clone());

        nl.run(&store, &DeliveryOptions::default()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, vec!["reader@example.com"]);
        let expected = unsubscribe_url("https://site.example", "test-secret", "reader@example.com");
        assert!(sent[0].text.contains(&expected));
        assert!(store
            .get("reader@example.com")
            .await
            .unwrap()
            .unwrap()
            .last_email_sent
            .is_some());
    }

    #[tokio::test]
    async fn test_run_exclusive_rejects_concurrent_run() {
        let mailer = Arc::new(RecordingMailer::default());
        let nl = newsletter(vec![article(1)], false, mailer);
        let store = store_with(&[]).await;
        let guard = RunGuard::default();

        let _held = guard.try_start().unwrap();
        assert!(guard.is_running());
        let result = nl
            .run_exclusive(&guard, &store, &DeliveryOptions::default())
            .await;
        assert!(matches!(result, Err(NewsletterError::AlreadyRunning)));
    }
}
