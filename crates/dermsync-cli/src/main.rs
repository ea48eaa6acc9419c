use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dermsync_adapters::extract_eudract;
use dermsync_core::{SourceFamily, TrialId};
use dermsync_storage::{LookupField, RecordStore};
use dermsync_sync::{Reconciler, StatusClass, StatusClassifier, SyncConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "dermsync")]
#[command(about = "Dermatology clinical-trial sync and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once and reconcile into the store.
    Sync,
    /// Classify a status string against the configured allow-lists.
    Classify { family: SourceFamily, status: String },
    /// Print the first EudraCT-shaped identifier in a file.
    Extract { file: PathBuf },
    /// Print the stored record for an identifier.
    Show { id: String },
    /// List stored records whose field equals the given text.
    Find {
        #[arg(long)]
        field: LookupField,
        #[arg(long)]
        value: String,
    },
    /// Delete stored records of a family whose status is no longer allowed.
    Purge {
        #[arg(long)]
        family: SourceFamily,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("dermsync=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = dermsync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} trials={} inserted={} updated={} deleted={} unlinked={} failures={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.parsed_drafts,
                summary.totals.inserted,
                summary.totals.updated,
                summary.totals.deleted,
                summary.totals.unlinked.len(),
                summary.totals.failures.len(),
                summary.reports_dir
            );
        }
        Commands::Classify { family, status } => {
            let classifier = classifier_for(&config);
            let class = match classifier.classify(family, &status) {
                StatusClass::Active => "active",
                StatusClass::Inactive => "inactive",
            };
            println!("{class}");
        }
        Commands::Extract { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            match extract_eudract(&text) {
                Some(id) => println!("{id}"),
                None => println!("not found"),
            }
        }
        Commands::Show { id } => {
            let store = config.open_store()?;
            match store.get(&TrialId::new(id.as_str()))? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("not found: {id}"),
            }
        }
        Commands::Find { field, value } => {
            let store = config.open_store()?;
            for record in store.find(field, &value)? {
                println!("{}\t{}\t{}", record.identifier, record.overall_status, record.title);
            }
        }
        Commands::Purge { family } => {
            let classifier = config.load_registry()?.classifier();
            if classifier.policy(family).is_none() {
                anyhow::bail!("no allow-list configured for {family}; refusing to purge");
            }
            let mut store = config.open_store()?;
            let report = Reconciler::new(&mut store, &classifier).purge_inactive(family)?;
            println!("purged {} {family} trials", report.deleted.len());
            for id in &report.deleted {
                println!("- {id}");
            }
            for failure in &report.failures {
                eprintln!("failed to delete {}: {}", failure.identifier, failure.error);
            }
        }
    }

    Ok(())
}

/// Allow-lists from `sources.yaml`, or the built-in defaults when the
/// registry cannot be read.
fn classifier_for(config: &SyncConfig) -> StatusClassifier {
    match config.load_registry() {
        Ok(registry) => registry.classifier(),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "using default status allow-lists");
            StatusClassifier::with_defaults()
        }
    }
}
