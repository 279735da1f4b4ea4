//! Newsletter CLI - manual runs, subscriber maintenance and webhook setup.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};

use newsletter_backend::config::AppConfig;
use newsletter_backend::db;
use newsletter_backend::logging::{self, LogTarget};
use newsletter_backend::newsletter::{DeliveryOptions, Newsletter};
use newsletter_backend::scheduler::Schedule;
use newsletter_backend::state::open_subscriber_store;
use newsletter_backend::subscribers::{
    import_into, normalize_email, JsonFileStore, PgSubscriberStore, SubscriberStore,
};
use newsletter_backend::webhook::{generate_secret, WebhookStore};

#[derive(Parser, Debug)]
#[command(name = "newsletter", author, version, about = "AI news newsletter tools.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose today's issue and send it to every active subscriber
    Send {
        /// Render everything but send nothing
        #[arg(long)]
        dry_run: bool,
        /// Send to at most this many subscribers
        #[arg(long)]
        limit: Option<usize>,
        /// Send only to this address
        #[arg(long, value_name = "EMAIL")]
        to: Option<String>,
    },
    /// Compose an issue and write the HTML without sending
    Preview {
        #[arg(long, value_name = "FILE", default_value = "newsletter-preview.html")]
        out: PathBuf,
        #[arg(long, value_name = "EMAIL", default_value = "preview@example.com")]
        email: String,
    },
    Subscribers {
        #[command(subcommand)]
        action: SubscriberAction,
    },
    /// Copy subscribers from the JSON file into the database
    ImportJson {
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriberAction {
    List {
        /// Only show active subscribers
        #[arg(long)]
        active: bool,
    },
    Add {
        email: String,
    },
    Unsubscribe {
        email: String,
    },
    /// Delete the record entirely
    Remove {
        email: String,
    },
}

#[derive(Subcommand, Debug)]
enum WebhookAction {
    /// Create an enabled config with a fresh secret
    Init {
        /// Restrict triggers to these client addresses
        #[arg(long = "allow-ip", value_name = "IP")]
        allow_ips: Vec<String>,
    },
    /// Replace the secret, keeping the other settings
    Rotate,
    Enable,
    Disable,
    Show,
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// Print upcoming fire times (defaults to NEWSLETTER_CRON)
    Next {
        expr: Option<String>,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let _log_guards = logging::init(LogTarget::Cli);
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Send { dry_run, limit, to } => send(&config, dry_run, limit, to).await,
        Commands::Preview { out, email } => preview(&config, out, &email).await,
        Commands::Subscribers { action } => subscribers(&config, action).await,
        Commands::ImportJson { file } => import_json(&config, file).await,
        Commands::Webhook { action } => webhook(&config, action).await,
        Commands::Schedule { action } => schedule(&config, action),
    }
}

async fn send(
    config: &AppConfig,
    dry_run: bool,
    limit: Option<usize>,
    to: Option<String>,
) -> anyhow::Result<()> {
    let store = open_subscriber_store(config).await;
    let newsletter = Newsletter::from_config(config)?;

    let options = DeliveryOptions {
        dry_run,
        limit,
        only: to.as_deref().map(normalize_email).transpose()?,
    };

    let report = newsletter.run(store.as_ref(), &options).await?;

    println!("Run       : {}", report.run_id);
    println!("Subject   : {}", report.subject);
    println!("Stories   : {}", report.stories);
    println!("Recipients: {}", report.delivery.recipients);
    println!("Delivered : {}", report.delivery.delivered);
    for failure in &report.delivery.failed {
        println!("Failed    : {} ({})", failure.email, failure.error);
    }
    if report.delivery.dry_run {
        println!("(dry run, nothing was sent)");
    }

    if !report.delivery.failed.is_empty() {
        bail!("{} deliveries failed", report.delivery.failed.len());
    }
    Ok(())
}

async fn preview(config: &AppConfig, out: PathBuf, email: &str) -> anyhow::Result<()> {
    let email = normalize_email(email)?;
    let newsletter = Newsletter::from_config(config)?;

    let issue = newsletter.compose().await?;
    let rendered = newsletter.render_for(&issue, &email)?;

    tokio::fs::write(&out, rendered.html)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;

    println!("{}", rendered.text);
    println!("HTML preview written to {}", out.display());
    Ok(())
}

async fn subscribers(config: &AppConfig, action: SubscriberAction) -> anyhow::Result<()> {
    let store = open_subscriber_store(config).await;

    match action {
        SubscriberAction::List { active } => {
            let list = if active {
                store.active().await?
            } else {
                store.list().await?
            };
            for s in &list {
                println!(
                    "{:<40} {:<6} since {}  last sent {}",
                    s.email,
                    if s.subscribed { "active" } else { "off" },
                    s.subscribed_at.format("%Y-%m-%d"),
                    s.last_email_sent
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
            println!("{} subscribers ({})", list.len(), store.backend());
        }
        SubscriberAction::Add { email } => {
            let email = normalize_email(&email)?;
            let outcome = store.subscribe(&email).await?;
            println!("{email}: {outcome:?}");
        }
        SubscriberAction::Unsubscribe { email } => {
            let email = normalize_email(&email)?;
            let outcome = store.unsubscribe(&email).await?;
            println!("{email}: {outcome:?}");
        }
        SubscriberAction::Remove { email } => {
            let email = normalize_email(&email)?;
            if store.remove(&email).await? {
                println!("{email}: removed");
            } else {
                println!("{email}: not found");
            }
        }
    }

    Ok(())
}

async fn import_json(config: &AppConfig, file: Option<PathBuf>) -> anyhow::Result<()> {
    if !config.database_configured() {
        bail!("DATABASE_URL is not set, nothing to import into");
    }
    let Some(pool) = db::connect_if_configured(&config.db).await else {
        bail!("could not connect to the database at DATABASE_URL");
    };

    let source = JsonFileStore::new(file.unwrap_or_else(|| config.subscribers_file.clone()));
    let target = PgSubscriberStore::new(pool);
    let normalized = target.normalize_stored_emails().await?;
    let count = import_into(&source, &target).await?;

    if normalized > 0 {
        println!("Normalized {normalized} existing database emails");
    }
    println!("Imported {} subscribers from {}", count, source.path().display());
    Ok(())
}

async fn webhook(config: &AppConfig, action: WebhookAction) -> anyhow::Result<()> {
    let store = WebhookStore::new(config.webhook_file.clone());

    let updated = match action {
        WebhookAction::Init { allow_ips } => {
            store
                .update(|c| {
                    c.webhook_secret = generate_secret();
                    c.allowed_ips = allow_ips;
                    c.enabled = true;
                })
                .await?
        }
        WebhookAction::Rotate => store.update(|c| c.webhook_secret = generate_secret()).await?,
        WebhookAction::Enable => {
            let config = store.update(|c| c.enabled = true).await?;
            if config.webhook_secret.is_empty() {
                println!("warning: no secret configured, run `newsletter webhook rotate`");
            }
            config
        }
        WebhookAction::Disable => store.update(|c| c.enabled = false).await?,
        WebhookAction::Show => store.load().await?,
    };

    println!("{}", serde_json::to_string_pretty(&updated)?);
    println!("(stored in {})", store.path().display());
    Ok(())
}

fn schedule(config: &AppConfig, action: ScheduleAction) -> anyhow::Result<()> {
    match action {
        ScheduleAction::Next { expr, count } => {
            let Some(expr) = expr.or_else(|| config.schedule.clone()) else {
                bail!("no expression given and NEWSLETTER_CRON is not set");
            };
            let schedule = Schedule::parse(&expr)?;
            for time in schedule.upcoming(Utc::now(), count) {
                println!("{}", time.format("%a %Y-%m-%d %H:%M UTC"));
            }
        }
    }
    Ok(())
}
