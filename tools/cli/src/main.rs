//! FS Monitoring offline sync CLI.
//!
//! Operates the local submission queue and the sync engine against the
//! configured server.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fsmonitor_app::{AppConfig, OfflineApp, CONFIG_FILENAME};
use fsmonitor_common::{LocalId, ServerId};
use fsmonitor_intercept::{Fetcher, HttpFetcher, Request, ResponseSource};
use fsmonitor_storage::{PendingSubmission, SubmissionStatus, Transition};
use fsmonitor_sync::{Connectivity, RefreshOutcome, SubmitOutcome, SyncOutcome};

#[derive(Parser)]
#[command(name = "fsmonitor")]
#[command(about = "Offline-first audit submission queue and sync engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to config.json in the data directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the offline database.
    Init {
        /// Server base URL.
        #[arg(long)]
        base_url: Option<String>,

        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Submit an audit payload, queueing it when the server is unreachable.
    Submit {
        /// Payload as inline JSON.
        #[arg(conflicts_with = "file")]
        payload: Option<String>,

        /// Read the payload from a JSON file.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Queue without attempting direct delivery.
        #[arg(long)]
        offline: bool,
    },

    /// List queued submissions.
    Pending {
        /// Only show submissions with this status (pending, failed, synced).
        #[arg(short, long)]
        status: Option<String>,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show connectivity, sync state and queue length.
    Status,

    /// Deliver every pending submission now.
    Sync,

    /// Download reference data for offline use.
    Refresh,

    /// Delete synced submissions and history older than the retention windows.
    Purge {
        /// Retention in days (defaults to the configured value).
        #[arg(short, long)]
        days: Option<u32>,

        /// History retention in days (defaults to the configured value).
        #[arg(long)]
        history_days: Option<u32>,
    },

    /// Return failed submissions to the pending queue.
    Requeue {
        /// Requeue every failed submission regardless of backoff.
        #[arg(long, conflicts_with = "id")]
        all: bool,

        /// Requeue one submission, including one held for review.
        #[arg(long)]
        id: Option<i64>,
    },

    /// Mark a submission held for review as delivered.
    Resolve {
        /// Local id of the submission.
        id: i64,

        /// Identifier the server assigned to it.
        #[arg(long)]
        server_id: String,
    },

    /// Show delivered submissions.
    History,

    /// Show a single queued submission.
    Show {
        /// Local id of the submission.
        id: i64,
    },

    /// Fetch a site path through the offline interception layer.
    Fetch {
        /// Path relative to the server base URL.
        path: String,

        /// Treat the request as a page navigation.
        #[arg(long)]
        navigate: bool,
    },

    /// Run the background sync worker until interrupted.
    Run {
        /// Seconds between connectivity checks.
        #[arg(long, default_value = "15")]
        check_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config;
    match cli.command {
        Commands::Init { base_url, force } => cmd_init(config_path, base_url, force).await,

        Commands::Submit {
            payload,
            file,
            offline,
        } => cmd_submit(config_path, payload, file, offline).await,

        Commands::Pending { status, json } => cmd_pending(config_path, status, json).await,

        Commands::Status => cmd_status(config_path).await,

        Commands::Sync => cmd_sync(config_path).await,

        Commands::Refresh => cmd_refresh(config_path).await,

        Commands::Purge { days, history_days } => cmd_purge(config_path, days, history_days).await,

        Commands::Requeue { all, id } => cmd_requeue(config_path, all, id).await,

        Commands::Resolve { id, server_id } => cmd_resolve(config_path, id, &server_id).await,

        Commands::History => cmd_history(config_path).await,

        Commands::Show { id } => cmd_show(config_path, id).await,

        Commands::Fetch { path, navigate } => cmd_fetch(config_path, &path, navigate).await,

        Commands::Run { check_interval } => cmd_run(config_path, check_interval).await,
    }
}

/// Load configuration and open the app without a background worker.
async fn open_app(config_path: Option<PathBuf>) -> Result<OfflineApp> {
    let mut config =
        AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    config.background.enabled = false;
    let (app, _) = OfflineApp::open(config)
        .await
        .context("Failed to open offline store")?;
    Ok(app)
}

fn print_submission(record: &PendingSubmission) {
    let id = record
        .local_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "  #{:<5} {:<8} created {}  attempts {}",
        id,
        record.status.as_str(),
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.attempts
    );
    if let Some(server_id) = &record.server_id {
        line.push_str(&format!("  server id {}", server_id));
    }
    if record.needs_review() {
        line.push_str("  (needs review)");
    }
    println!("{}", line);
    if let Some(error) = &record.last_error {
        println!("         last error: {}", error);
    }
}

fn print_sync_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Skipped(reason) => println!("Sync skipped: {:?}", reason),
        SyncOutcome::Idle => println!("All data synced."),
        SyncOutcome::Completed(report) => {
            println!("Sync complete.");
            println!("  Synced: {}", report.synced);
            println!("  Failed: {}", report.failed);
            if report.unconfirmed > 0 {
                println!("  Unconfirmed: {} (see `fsmonitor resolve`)", report.unconfirmed);
            }
            if let Some(purged) = report.purged {
                println!("  Purged: {}", purged);
            }
            println!("  Took:   {:?}", report.duration);
        }
        SyncOutcome::Aborted(reason) => println!("Sync failed: {}", reason),
    }
}

/// Write the configuration file and create the database.
async fn cmd_init(config_path: Option<PathBuf>, base_url: Option<String>, force: bool) -> Result<()> {
    let mut config = AppConfig::default();
    config.apply_overrides(|key| std::env::var(key).ok());
    if let Some(base_url) = base_url {
        config.server.base_url = base_url;
    }
    config.validate().context("Invalid configuration")?;

    let path = config_path.unwrap_or_else(|| config.data_dir().join(CONFIG_FILENAME));
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    config.save(&path).context("Failed to write configuration")?;
    info!("Wrote configuration to {}", path.display());

    config.background.enabled = false;
    let (app, _) = OfflineApp::open(config)
        .await
        .context("Failed to create offline store")?;

    println!("Initialized offline store.");
    println!("  Config:   {}", path.display());
    println!("  Server:   {}", app.config().server.base_url);
    println!("  Database: {}", app.config().database_path().display());

    Ok(())
}

/// Submit a payload through the coordinator.
async fn cmd_submit(
    config_path: Option<PathBuf>,
    payload: Option<String>,
    file: Option<PathBuf>,
    offline: bool,
) -> Result<()> {
    let raw = match (payload, file) {
        (Some(payload), None) => payload,
        (None, Some(file)) => std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?,
        _ => anyhow::bail!("Provide a payload or --file"),
    };
    let payload: Value = serde_json::from_str(&raw).context("Payload is not valid JSON")?;

    let app = open_app(config_path).await?;
    if offline {
        app.coordinator().handle_offline();
    }

    match app
        .coordinator()
        .submit(payload)
        .await
        .context("Failed to submit")?
    {
        SubmitOutcome::Delivered(server_id) => {
            println!("Submission delivered (server id {}).", server_id);
        }
        SubmitOutcome::Queued(local_id) => {
            println!("Saved offline as #{}. It will sync when online.", local_id);
        }
        SubmitOutcome::Unconfirmed(local_id) => {
            println!(
                "Server accepted the submission without an id. Kept as #{} for review; it will not be resent.",
                local_id
            );
        }
    }

    Ok(())
}

/// List queued submissions.
async fn cmd_pending(config_path: Option<PathBuf>, status: Option<String>, json: bool) -> Result<()> {
    let app = open_app(config_path).await?;
    let store = app.store();

    let records = match status.as_deref() {
        None => store.list_submissions().await,
        Some("pending") => store.list_by_status(SubmissionStatus::Pending).await,
        Some("failed") => store.list_by_status(SubmissionStatus::Failed).await,
        Some("synced") => store.list_by_status(SubmissionStatus::Synced).await,
        Some(other) => anyhow::bail!("Invalid status '{}'. Use: pending, failed, or synced", other),
    }
    .context("Failed to list submissions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No submissions.");
    } else {
        println!("Submissions:");
        for record in &records {
            print_submission(record);
        }
    }

    Ok(())
}

/// Show engine status.
async fn cmd_status(config_path: Option<PathBuf>) -> Result<()> {
    let app = open_app(config_path).await?;
    let status = app.engine().status().await.context("Failed to read status")?;
    let failed = app
        .store()
        .list_by_status(SubmissionStatus::Failed)
        .await
        .context("Failed to list submissions")?;

    println!("Offline store status:");
    println!("  Server:   {}", app.config().server.base_url);
    println!("  Backend:  {}", app.store().records().name());
    println!("  Online:   {}", status.is_online);
    println!("  Syncing:  {}", status.is_syncing);
    println!("  Pending:  {}", status.pending_count);
    println!("  Failed:   {}", failed.len());
    println!("  Review:   {}", status.unconfirmed_count);

    Ok(())
}

/// Run a manual sync pass.
async fn cmd_sync(config_path: Option<PathBuf>) -> Result<()> {
    let app = open_app(config_path).await?;
    let outcome = app
        .coordinator()
        .manual_sync()
        .await
        .context("Sync not possible")?;
    print_sync_outcome(&outcome);
    Ok(())
}

/// Refresh cached reference data.
async fn cmd_refresh(config_path: Option<PathBuf>) -> Result<()> {
    let app = open_app(config_path).await?;

    match app.engine().refresh_reference_data().await {
        RefreshOutcome::Skipped(reason) => println!("Refresh skipped: {:?}", reason),
        RefreshOutcome::Completed(report) => {
            println!("Data ready for offline use.");
            for (kind, count) in &report.cached {
                println!("  {:<24} {}", kind.to_string(), count);
            }
            if app.config().sync.refresh_checklist_items {
                println!("  {:<24} {}", "checklist_items", report.checklist_items);
            }
            for failure in &report.failures {
                warn!("{}", failure);
            }
            if !report.failures.is_empty() {
                println!("  {} fetches failed; older data kept.", report.failures.len());
            }
        }
        RefreshOutcome::Aborted(reason) => anyhow::bail!("Refresh failed: {}", reason),
    }

    Ok(())
}

/// Purge old synced submissions and delivery history.
async fn cmd_purge(
    config_path: Option<PathBuf>,
    days: Option<u32>,
    history_days: Option<u32>,
) -> Result<()> {
    let app = open_app(config_path).await?;
    let days = days.unwrap_or(app.config().sync.retention_days);
    let history_days = history_days.unwrap_or(app.config().sync.history_retention_days);
    let purged = app
        .store()
        .purge_synced_older_than(days)
        .await
        .context("Failed to purge")?;
    let history = app
        .store()
        .purge_history_older_than(history_days)
        .await
        .context("Failed to purge history")?;
    println!("Purged {} synced submissions older than {} days.", purged, days);
    println!("Purged {} history entries older than {} days.", history, history_days);
    Ok(())
}

/// Requeue failed submissions.
async fn cmd_requeue(config_path: Option<PathBuf>, all: bool, id: Option<i64>) -> Result<()> {
    let app = open_app(config_path).await?;

    if let Some(id) = id {
        let transition = app
            .store()
            .requeue_submission(LocalId::new(id))
            .await
            .with_context(|| format!("Failed to requeue #{}", id))?;
        match transition {
            Transition::Applied => println!("Requeued #{}.", id),
            Transition::Unchanged => println!("#{} is not failed; nothing to do.", id),
        }
        return Ok(());
    }

    let requeued = if all {
        app.store().requeue_failed(|_| true).await
    } else {
        app.requeue_due().await
    }
    .context("Failed to requeue")?;

    if requeued.is_empty() {
        println!("Nothing to requeue.");
    } else {
        let ids: Vec<String> = requeued.iter().map(|id| format!("#{}", id)).collect();
        println!("Requeued {}: {}", requeued.len(), ids.join(", "));
    }
    Ok(())
}

/// Record the server id of a submission held for review.
async fn cmd_resolve(config_path: Option<PathBuf>, id: i64, server_id: &str) -> Result<()> {
    let app = open_app(config_path).await?;
    let server_id = ServerId::new(server_id).context("Invalid server id")?;
    let transition = app
        .store()
        .mark_synced(LocalId::new(id), server_id.clone())
        .await
        .with_context(|| format!("Failed to resolve #{}", id))?;
    match transition {
        Transition::Applied => println!("#{} recorded as delivered (server id {}).", id, server_id),
        Transition::Unchanged => println!("#{} was already synced.", id),
    }
    Ok(())
}

/// Show delivered submissions.
async fn cmd_history(config_path: Option<PathBuf>) -> Result<()> {
    let app = open_app(config_path).await?;
    let completed = app
        .store()
        .completed_submissions()
        .await
        .context("Failed to read history")?;

    if completed.is_empty() {
        println!("No delivered submissions.");
        return Ok(());
    }

    println!("Delivered submissions:");
    for record in &completed {
        let id = match record.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => "-".to_string(),
        };
        let synced_at = record
            .get("synced_at")
            .and_then(Value::as_str)
            .unwrap_or("-");
        println!("  server id {:<10} synced {}", id, synced_at);
    }
    Ok(())
}

/// Show one submission in full.
async fn cmd_show(config_path: Option<PathBuf>, id: i64) -> Result<()> {
    let app = open_app(config_path).await?;
    let record = app
        .store()
        .get_submission(LocalId::new(id))
        .await
        .context("Failed to read submission")?
        .with_context(|| format!("No submission #{}", id))?;

    print_submission(&record);
    println!("{}", serde_json::to_string_pretty(&record.payload)?);
    Ok(())
}

/// Fetch a path through the interception layer.
async fn cmd_fetch(config_path: Option<PathBuf>, path: &str, navigate: bool) -> Result<()> {
    let app = open_app(config_path).await?;
    let interceptor = app.interceptor();

    if let Err(e) = interceptor.install().await {
        warn!("Pre-caching failed: {}", e);
    }

    let url = url::Url::parse(&app.config().server.base_url)?
        .join(path)
        .with_context(|| format!("Invalid path '{}'", path))?;
    let request = if navigate {
        Request::navigate(url.as_str())?
    } else {
        Request::get(url.as_str())?
    };

    let intercepted = interceptor
        .handle(&request)
        .await
        .context("Request failed")?;
    let source = match intercepted.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::OfflinePage => "offline page",
        ResponseSource::Synthesized => "synthesized",
    };

    eprintln!(
        "{} ({}, {})",
        intercepted.response.status,
        source,
        intercepted.response.content_type().unwrap_or("no content type")
    );
    println!("{}", String::from_utf8_lossy(&intercepted.response.body));
    Ok(())
}

/// Ask the server for its base URL and report connectivity.
async fn check_connectivity(fetcher: &dyn Fetcher, base_url: &str) -> Connectivity {
    let request = match Request::get(base_url) {
        Ok(request) => request,
        Err(_) => return Connectivity::Offline,
    };
    match fetcher.fetch(&request).await {
        Ok(_) => Connectivity::Online,
        Err(_) => Connectivity::Offline,
    }
}

/// Run the worker, the connectivity checks and the event log until Ctrl-C.
async fn cmd_run(config_path: Option<PathBuf>, check_interval: u64) -> Result<()> {
    if check_interval == 0 {
        anyhow::bail!("--check-interval must be > 0");
    }

    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let (app, worker) = OfflineApp::open(config)
        .await
        .context("Failed to open offline store")?;

    match app.interceptor().install().await {
        Ok(count) => info!("Pre-cached {} assets", count),
        Err(e) => warn!("Pre-caching failed: {}", e),
    }
    match app.interceptor().activate().await {
        Ok(deleted) if !deleted.is_empty() => info!("Deleted stale caches: {}", deleted.join(", ")),
        Ok(_) => {}
        Err(e) => warn!("Cache cleanup failed: {}", e),
    }

    let worker_task = worker.map(|worker| app.spawn_worker(worker));

    let mut events = app.engine().bus().subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("[{}] {}", event.status.as_str(), event.message);
        }
    });

    let fetcher = HttpFetcher::new(app.config().server.timeout())?;
    let base_url = app.config().server.base_url.clone();
    let initial = check_connectivity(&fetcher, &base_url).await;
    let (tx, rx) = watch::channel(initial);

    let coordinator = Arc::clone(app.coordinator());
    let watch_task = tokio::spawn(async move { coordinator.watch(rx).await });

    let check_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(check_interval));
        loop {
            ticker.tick().await;
            let state = check_connectivity(&fetcher, &base_url).await;
            if tx.send(state).is_err() {
                break;
            }
        }
    });

    println!("Background sync running (Ctrl-C to stop).");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down at {}", Utc::now().format("%H:%M:%S"));
    check_task.abort();
    let _ = watch_task.await;
    app.shutdown().await;
    if let Some(task) = worker_task {
        let _ = task.await;
    }
    event_task.abort();

    Ok(())
}
