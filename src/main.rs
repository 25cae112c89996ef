//! Command-line interface for crm-sync
//!
//! # Usage Examples
//!
//! ## Sync
//! ```bash
//! # Full sync of deals from an exported JSONL dataset
//! crm-sync sync full deals --source-dir ./export
//!
//! # Incremental sync with a small page size, deferring on rate budget
//! crm-sync sync incremental organizations \
//!   --source-dir ./export --page-size 50 --deferred
//! ```
//!
//! ## Webhooks
//! ```bash
//! # Apply one event from a JSON file ("-" reads stdin)
//! crm-sync webhook --source-dir ./export --event merge_event.json
//! ```
//!
//! ## Operations
//! ```bash
//! # Component status as JSON
//! crm-sync status --source-dir ./export
//!
//! # Reset circuit breakers after an incident
//! crm-sync reset circuits --source-dir ./export
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use crm_sync::{
    BudgetOpts, JsonlCrmClient, MemoryStore, ResetTarget, ServiceConfig, SyncOpts, SyncService,
    WebhookEvent,
};
use resilience::MemoryCounterStore;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use sync_core::{EntityType, SyncMode};

#[derive(Parser)]
#[command(name = "crm-sync")]
#[command(about = "Resilient synchronization of rate-limited CRM APIs into local storage")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Clone)]
struct SourceOpts {
    /// Directory of <entity>.jsonl files serving as the remote dataset
    #[arg(long, env = "CRM_SYNC_SOURCE_DIR")]
    source_dir: PathBuf,

    #[command(flatten)]
    budget: BudgetOpts,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync for an entity type
    Sync {
        /// Sync mode: full or incremental
        mode: SyncMode,

        /// Entity type to synchronize (e.g. deals, organizations)
        entity: EntityType,

        #[command(flatten)]
        source: SourceOpts,

        #[command(flatten)]
        opts: SyncOpts,
    },

    /// Apply one webhook event
    Webhook {
        #[command(flatten)]
        source: SourceOpts,

        /// Path to the event JSON ("-" reads stdin)
        #[arg(long)]
        event: String,

        /// Reject unrecognized event actions instead of applying them as
        /// updates
        #[arg(long)]
        reject_unknown: bool,
    },

    /// Print component status as JSON
    Status {
        #[command(flatten)]
        source: SourceOpts,
    },

    /// Reset a stateful component (all, rate, circuits, health)
    Reset {
        /// Component to reset
        #[arg(default_value = "all")]
        target: ResetTarget,

        #[command(flatten)]
        source: SourceOpts,
    },
}

fn build_service(source: &SourceOpts, reject_unknown: bool) -> SyncService {
    let client = Arc::new(JsonlCrmClient::new(&source.source_dir));
    let store = Arc::new(MemoryStore::new());
    let mut config = ServiceConfig {
        rate: (&source.budget).into(),
        ..Default::default()
    };
    config.webhook.reject_unknown_events = reject_unknown;
    SyncService::new(
        client,
        store.clone(),
        store,
        Arc::new(MemoryCounterStore::new()),
        config,
    )
}

fn read_event(path: &str) -> anyhow::Result<serde_json::Value> {
    let raw = if path == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading event from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading event file {path}"))?
    };
    serde_json::from_str(&raw).context("parsing event JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            mode,
            entity,
            source,
            opts,
        } => {
            let service = build_service(&source, false);
            let options = opts.to_options(mode)?;
            let result = service.run_sync(entity, options).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Webhook {
            source,
            event,
            reject_unknown,
        } => {
            let service = build_service(&source, reject_unknown);
            let value = read_event(&event)?;
            let event = WebhookEvent::from_json(&value)
                .map_err(|err| anyhow::anyhow!("invalid event: {err}"))?;
            let result = service.apply_webhook(event).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Status { source } => {
            let service = build_service(&source, false);
            let report = service.status().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Reset { target, source } => {
            let service = build_service(&source, false);
            service.reset(target).await?;
            println!("reset complete");
        }
    }

    Ok(())
}
