//! Email rendering with embedded Tera templates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tera::{Context, Tera};

use super::NewsletterError;

const HTML_TEMPLATE: &str = "newsletter.html";
const TEXT_TEMPLATE: &str = "newsletter.txt";

/// One summarized story of an issue
#[derive(Debug, Clone, Serialize)]
pub struct Story {
    pub title: String,
    pub url: String,
    pub source: Option<String>,
    pub summary: String,
}

/// A composed newsletter, independent of any recipient
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub title: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub introduction: String,
    pub stories: Vec<Story>,
}

/// Per-recipient output
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub struct Renderer {
    tera: Tera,
    site_url: String,
}

impl Renderer {
    pub fn new(site_url: impl Into<String>) -> Result<Self, NewsletterError> {
        let mut tera = Tera::default();
        // Names ending in .html get Tera's autoescaping; the text one does not.
        tera.add_raw_templates(vec![
            (
                HTML_TEMPLATE,
                include_str!("../../templates/newsletter.html.tera"),
            ),
            (
                TEXT_TEMPLATE,
                include_str!("../../templates/newsletter.txt.tera"),
            ),
        ])?;
        Ok(Self {
            tera,
            site_url: site_url.into(),
        })
    }

    pub fn render(
        &self,
        issue: &Issue,
        recipient: &str,
        unsubscribe_url: &str,
    ) -> Result<RenderedEmail, NewsletterError> {
        let mut context = Context::new();
        context.insert("title", &issue.title);
        context.insert("subject", &issue.subject);
        context.insert("date", &format_issue_date(&issue.date));
        context.insert("introduction", &issue.introduction);
        context.insert("stories", &issue.stories);
        context.insert("recipient", recipient);
        context.insert("site_url", &self.site_url);
        context.insert("unsubscribe_url", unsubscribe_url);

        Ok(RenderedEmail {
            subject: issue.subject.clone(),
            html: self.tera.render(HTML_TEMPLATE, &context)?,
            text: self.tera.render(TEXT_TEMPLATE, &context)?,
        })
    }
}

pub fn format_issue_date(date: &DateTime<Utc>) -> String {
    date.format("%A, %B %-d, %Y").to_string()
}

pub fn issue_subject(prefix: &str, date: &DateTime<Utc>) -> String {
    format!("{} | {}", prefix, date.format("%b %-d, %Y"))
}
