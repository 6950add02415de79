use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use orchestra_core::{OrchestraConfig, Platform};
use orchestra_notify::{notify_bulk, GorushDispatcher, PushPayload, PushTarget};
use orchestra_scheduler::store::ProbeRegistry;
use orchestra_scheduler::{Scheduler, SqliteStore, TargetFilter};

/// orchestrad: schedules alerts and experiments and pushes them to probes.
#[derive(Parser, Debug)]
#[command(name = "orchestrad", version, about)]
struct Cli {
    /// Path to orchestra.toml (defaults to ~/.orchestra/orchestra.toml).
    #[arg(long, global = true, env = "ORCHESTRA_CONFIG")]
    config: Option<String>,

    /// Debug logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load active jobs and run them until interrupted.
    Start,
    /// Push a one-off alert to every matching probe.
    Notify {
        #[arg(long)]
        message: String,
        /// Repeatable; no value means every country.
        #[arg(long = "country")]
        countries: Vec<String>,
        /// Repeatable; no value means every platform.
        #[arg(long = "platform")]
        platforms: Vec<String>,
        /// Link opened when the alert is tapped.
        #[arg(long)]
        href: Option<String>,
        /// Actually send. Without it only the target count is reported.
        #[arg(long)]
        yes: bool,
    },
    /// Trust a PEM public key for signed experiments and print its key id.
    AddKey {
        #[arg(long)]
        pem: PathBuf,
    },
    /// List stored jobs.
    Jobs {
        /// Include deleted jobs.
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose {
        "orchestrad=debug,orchestra_scheduler=debug,orchestra_notify=debug"
    } else {
        "orchestrad=info,orchestra_scheduler=info,orchestra_notify=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();

    let config = OrchestraConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        OrchestraConfig::default()
    });

    let store = open_store(&config)?;

    match cli.command {
        Command::Start => start(&config, store).await,
        Command::Notify {
            message,
            countries,
            platforms,
            href,
            yes,
        } => {
            let filter = TargetFilter {
                countries,
                platforms: platforms.into_iter().map(Platform::from).collect(),
            };
            notify(&config, &store, filter, message, href, yes).await
        }
        Command::AddKey { pem } => {
            let text = std::fs::read_to_string(&pem)
                .with_context(|| format!("reading {}", pem.display()))?;
            let key_id = store.add_signing_key(&text)?;
            println!("{key_id}");
            Ok(())
        }
        Command::Jobs { all } => {
            for listing in store.list_jobs(all)? {
                let job = &listing.record;
                println!(
                    "{}\t{}\t{}\t{}\truns={}\tnext={}\tdone={}\t{}",
                    job.id,
                    job.kind.tag(),
                    job.state,
                    job.schedule,
                    job.times_run,
                    job.next_run_at,
                    job.is_done,
                    job.comment,
                );
            }
            Ok(())
        }
    }
}

async fn start(config: &OrchestraConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let dispatcher = GorushDispatcher::from_config(&config.notify)
        .context("push gateway is not configured")?;
    info!(push_url = %dispatcher.push_url(), "push gateway ready");

    let scheduler = Scheduler::new(
        store.clone(),
        store,
        Arc::new(dispatcher),
        &config.scheduler,
    );
    let armed = scheduler.start()?;
    info!(armed, "scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, waiting for in-flight runs");
    scheduler.shutdown().await;
    Ok(())
}

async fn notify(
    config: &OrchestraConfig,
    store: &SqliteStore,
    filter: TargetFilter,
    message: String,
    href: Option<String>,
    yes: bool,
) -> anyhow::Result<()> {
    let targets: Vec<PushTarget> = store
        .find_probes(&filter)?
        .into_iter()
        .map(PushTarget::from)
        .collect();
    if !yes {
        println!("{} probes match; pass --yes to send", targets.len());
        return Ok(());
    }

    let dispatcher = GorushDispatcher::from_config(&config.notify)
        .context("push gateway is not configured")?;
    let mut extra = serde_json::Map::new();
    if let Some(href) = href {
        extra.insert("href".to_string(), serde_json::Value::String(href));
    }
    let payload = PushPayload::Alert { message, extra };

    let report = notify_bulk(
        &dispatcher,
        &targets,
        &payload,
        config.notify.bulk_concurrency,
    )
    .await;
    info!(
        sent = report.sent,
        unsupported = report.unsupported,
        failed = report.failed,
        "broadcast finished"
    );
    println!(
        "sent={} unsupported={} failed={}",
        report.sent, report.unsupported, report.failed
    );
    Ok(())
}

fn open_store(config: &OrchestraConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(Arc::new(SqliteStore::new(db)?))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
