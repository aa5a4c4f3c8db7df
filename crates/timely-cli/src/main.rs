use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use timely_chat::{
    build_digest, run_reminder_loop, ChatConfig, ChatResponder, ContextBuilder, ReminderService, SnapshotCache,
};
use timely_core::{Clock, SystemClock};
use timely_storage::{DeadlineStore, PageSource, StaticPageSource};
use timely_sync::{build_pipeline, http_source, maybe_start_scheduler, SyncConfig, TriggerOrigin, TriggerOutcome};
use timely_web::{AppState, WebConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "timely")]
#[command(about = "Timely deadline scraper, store and assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP bridge, the scrape scheduler and the reminder loop.
    Serve,
    /// Run one scrape cycle now.
    Scrape {
        /// Parse a saved page instead of fetching the live one.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Create the database and apply migrations.
    Migrate,
    /// List deadlines due within the next N days.
    Next {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Print the daily digest.
    Digest,
    /// Delete deadlines that passed more than N days ago.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days_old: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,timely=info"));
    let json = std::env::var("TIMELY_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// SQLite creates the file but not its directory.
fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(rest) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<DeadlineStore> {
    ensure_database_dir(&config.database_url)?;
    DeadlineStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening deadline store {}", config.database_url))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}

async fn serve(config: SyncConfig) -> Result<()> {
    let chat_config = ChatConfig::from_env();
    let web_config = WebConfig::from_env();
    let timezone = chat_config.timezone()?;
    let urgency_window = chat_config.urgency_window()?;

    let store = open_store(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Arc::new(build_pipeline(
        &config,
        store.clone(),
        clock.clone(),
        http_source(&config)?,
    )?);

    let cache = Arc::new(SnapshotCache::new(store.clone(), clock.clone(), chat_config.cache_ttl()?));
    let context = ContextBuilder::new(
        pipeline.normalizer().rules().clone(),
        urgency_window,
        timezone,
    );
    let responder = Arc::new(ChatResponder::new(
        chat_config.build_generator()?,
        cache,
        context,
        clock.clone(),
    ));
    let reminders = Arc::new(ReminderService::new(
        store,
        chat_config.build_sink()?,
        clock,
        timezone,
    ));

    let scheduler = maybe_start_scheduler(pipeline.clone(), &config).await?;
    let reminder_task = tokio::spawn(run_reminder_loop(reminders.clone(), chat_config.reminder_interval()));

    let state = AppState {
        pipeline,
        responder,
        reminders,
        urgency_window,
        admin_token: web_config.admin_token.clone(),
    };
    timely_web::serve(state, web_config.port, shutdown_signal()).await?;

    reminder_task.abort();
    if let Some(mut scheduler) = scheduler {
        scheduler.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn scrape(config: SyncConfig, fixture: Option<PathBuf>) -> Result<()> {
    let store = open_store(&config).await?;
    let source: Arc<dyn PageSource> = match fixture {
        Some(path) => Arc::new(
            StaticPageSource::from_file(config.source_url.clone(), &path)
                .with_context(|| format!("reading fixture {}", path.display()))?,
        ),
        None => http_source(&config)?,
    };
    let pipeline = build_pipeline(&config, store, Arc::new(SystemClock), source)?;

    match pipeline.trigger(TriggerOrigin::Cli).await? {
        TriggerOutcome::Completed(summary) => {
            println!(
                "scrape complete: run_id={} extracted={} normalized={} discarded={} inserted={} updated={} unchanged={} flagged={}",
                summary.run_id,
                summary.extracted,
                summary.normalized,
                summary.discarded,
                summary.inserted,
                summary.updated,
                summary.unchanged,
                summary.flagged_for_review
            );
            if summary.parse_failure {
                eprintln!("parse failure: no deadline items found; store left untouched");
            }
        }
        TriggerOutcome::AlreadyRunning => eprintln!("a scrape is already running"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Scrape { fixture } => scrape(config, fixture).await?,
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Next { days } => {
            if !(1..=365).contains(&days) {
                bail!("--days must be between 1 and 365");
            }
            let timezone = config.timezone()?;
            let store = open_store(&config).await?;
            let deadlines = store
                .list_due_within(SystemClock.now(), Duration::days(days))
                .await?;
            if deadlines.is_empty() {
                println!("nothing due in the next {days} days");
            }
            for deadline in deadlines {
                println!(
                    "{:>4}  {}  [{}] {}",
                    deadline.id,
                    deadline.due_at.with_timezone(&timezone).format("%a %b %-d %-I:%M %p"),
                    deadline.category,
                    deadline.title
                );
            }
        }
        Commands::Digest => {
            let chat_config = ChatConfig::from_env();
            let store = open_store(&config).await?;
            let now = SystemClock.now();
            let deadlines = store.list_upcoming(now).await?;
            let digest = build_digest(&deadlines, now, chat_config.urgency_window()?, config.timezone()?);
            println!("{}", digest.render());
        }
        Commands::Cleanup { days_old } => {
            if !(0..=3650).contains(&days_old) {
                bail!("--days-old must be between 0 and 3650");
            }
            let store = open_store(&config).await?;
            let cutoff = SystemClock.now() - Duration::days(days_old);
            let deleted = store.delete_older_than(cutoff).await?;
            println!("deleted {deleted} deadlines due before {cutoff}");
            for item in store.open_review_items().await? {
                println!(
                    "review #{}: {:?} vs {:?} (similarity {:.2})",
                    item.id, item.title_a, item.title_b, item.confidence
                );
            }
        }
    }

    Ok(())
}
