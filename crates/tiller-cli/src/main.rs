use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tiller_storage::{
    BackoffPolicy, BookingStore, HttpBookingStore, HttpPollConfig, HttpPollSource,
    HttpStoreConfig, LogAlerts, LogNotifier, OperatorAlerts, PayloadArchive,
};
use tiller_sync::{
    build_cron_scheduler, load_catalog_rules, SyncConfig, SyncScheduler, WebhookPipeline,
};
use tiller_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "tiller")]
#[command(about = "Boat-hire booking reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook server (and the cron sweep if enabled).
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one reconciliation sweep and print the report.
    Sync,
    /// Query a running server's sync status.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 8080 }) {
        Commands::Serve { port } => {
            let (state, scheduler) = build_state(&config).await?;
            if let Some(scheduler) = scheduler {
                if config.scheduler_enabled {
                    let cron = build_cron_scheduler(scheduler, &config.sync_cron).await?;
                    cron.start().await.context("starting cron scheduler")?;
                    tracing::info!(cron = %config.sync_cron, "periodic reconciliation enabled");
                }
            }
            tiller_web::serve(state, port).await?;
        }
        Commands::Sync => {
            let (_state, scheduler) = build_state(&config).await?;
            let Some(scheduler) = scheduler else {
                bail!("TILLER_ENGINE_URL is not set; nothing to reconcile against");
            };
            let report = scheduler.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { server } => {
            let url = format!("{}/sync/status", server.trim_end_matches('/'));
            let status: serde_json::Value = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.http_timeout_secs))
                .build()
                .context("building http client")?
                .get(&url)
                .send()
                .await
                .with_context(|| format!("requesting {url}"))?
                .error_for_status()
                .context("sync status request failed")?
                .json()
                .await
                .context("decoding sync status response")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn build_state(config: &SyncConfig) -> Result<(AppState, Option<Arc<SyncScheduler>>)> {
    let rules = load_catalog_rules(&config.catalog_rules_path)?;
    let timeout = Duration::from_secs(config.http_timeout_secs);

    let store: Arc<dyn BookingStore> = Arc::new(HttpBookingStore::new(HttpStoreConfig {
        base_url: config.store_base_url.clone(),
        table: config.store_table.clone(),
        api_token: config.store_token.clone(),
        timeout,
        backoff: BackoffPolicy::default(),
    })?);
    let archive = PayloadArchive::new(&config.archive_dir);

    let pipeline = Arc::new(WebhookPipeline::new(
        Arc::clone(&store),
        Arc::new(LogNotifier),
        Some(archive),
        rules.clone(),
        config.timezone,
    ));

    let scheduler = match &config.engine_base_url {
        Some(engine_url) => {
            let engine = HttpPollSource::new(HttpPollConfig {
                base_url: engine_url.clone(),
                api_token: config.engine_token.clone().unwrap_or_default(),
                timeout,
                backoff: BackoffPolicy::default(),
            })?;
            Some(Arc::new(SyncScheduler::new(
                Arc::new(engine),
                Arc::clone(&store),
                Arc::new(LogAlerts) as Arc<dyn OperatorAlerts>,
                pipeline.reconciler(),
                rules,
                config.timezone,
                chrono::Duration::hours(config.lookback_hours),
                config.gap_parallelism,
                config.alert_examples,
            )))
        }
        None => None,
    };

    let state = AppState {
        pipeline,
        store,
        scheduler: scheduler.clone(),
    };
    Ok((state, scheduler))
}
