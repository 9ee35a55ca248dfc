use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dh_adapters::{FeedApi, FeedApiConfig};
use dh_storage::{DraftCursor, HttpClientConfig, HttpFetcher, MatchStore, RateLimiter, Transport};
use dh_sync::{bootstrap_seq, HarvestConfig, Harvester, WorkerGate};
use tracing::{info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dh-cli")]
#[command(about = "Draft harvester command-line interface")]
struct Cli {
    /// YAML config file; environment variables still take precedence.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest until interrupted.
    Run,
    /// Print the sequence number the feed would start from.
    Bootstrap,
    /// Summarize the stored dataset.
    Stats,
    /// Dump stored drafts as JSON.
    Drafts {
        #[arg(long, default_value_t = 0)]
        from: i64,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Walk the whole dataset, one page per line.
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info,sqlx=warn")?;
    let config = HarvestConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Bootstrap => {
            let api = FeedApi::new(
                transport(&config)?,
                FeedApiConfig::new(config.feed_base_url.clone(), config.api_key.clone()),
            );
            let limiter = RateLimiter::new("feed", config.feed.pacing());
            let gate = WorkerGate::new();
            let seq = bootstrap_seq(&api, &limiter, config.max_retry, &gate.signal()).await?;
            println!("{seq}");
        }
        Commands::Stats => {
            let store = open_store(&config, false).await?;
            let total = store.get_total_examples().await?;
            let median = store.get_percentile_id(0.5).await?;
            let p90 = store.get_percentile_id(0.9).await?;
            println!(
                "{}",
                serde_json::json!({
                    "database": store.path().display().to_string(),
                    "total_examples": total,
                    "median_match_id": median,
                    "p90_match_id": p90,
                })
            );
            store.close().await?;
        }
        Commands::Drafts { from, limit, all } => {
            let store = open_store(&config, false).await?;
            if all {
                let mut cursor = DraftCursor::new(&store, limit).starting_at(from);
                while let Some(page) = cursor.next_batch().await? {
                    println!("{}", serde_json::to_string(&page)?);
                }
            } else {
                let page = store.get_drafts(from, limit).await?;
                println!("{}", serde_json::to_string_pretty(&page)?);
            }
            store.close().await?;
        }
    }

    Ok(())
}

fn transport(config: &HarvestConfig) -> Result<Arc<dyn Transport>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(Arc::new(fetcher))
}

async fn open_store(config: &HarvestConfig, mem_only: bool) -> Result<MatchStore> {
    MatchStore::open(&config.database_path, mem_only)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))
}

async fn run(config: HarvestConfig) -> Result<()> {
    let transport = transport(&config)?;
    let store = Arc::new(open_store(&config, config.mem_only).await?);
    if config.work_in_memory && !config.mem_only {
        store.to_memory().await.context("loading store into memory")?;
    }

    let harvester = Harvester::new(config, transport, store.clone());
    let start_seq = harvester.bootstrap().await?;
    let mut running = harvester.start(start_seq);

    let fatal = tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("listening for ctrl-c")?;
            info!("interrupt received, stopping workers");
            None
        }
        fatal = running.wait_fatal() => fatal,
    };

    let feed_cursor = running.cursor();
    let stopped = running.shutdown().await;
    drop(harvester);
    info!(
        feed_cursor,
        "feed position at shutdown; matches still queued were not committed, so resuming \
         with DH_START_SEQ set to it skips them"
    );

    match Arc::try_unwrap(store) {
        Ok(store) => store.close().await.context("closing store")?,
        Err(_) => warn!("store still in use, skipping close"),
    }

    if let Some(err) = fatal {
        return Err(err).context("harvest aborted");
    }
    let snapshot = stopped?;
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}
