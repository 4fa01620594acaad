use anyhow::Result;
use apc_source::{HttpSourceClient, SourceClientConfig};
use apc_storage::Store;
use apc_sync::{ReconcileOptions, Reconciler, SyncConfig, Tier};
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "apc-cli")]
#[command(about = "Alberta Purchasing Connection posting watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Re-check known postings, tier by tier.
    Reconcile {
        /// Restrict the run to one tier (1-4).
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
        tier: Option<u8>,
        /// Report what would be checked without fetching or writing.
        #[arg(long)]
        dry_run: bool,
        /// Check at most N candidates per tier.
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Scan for postings past the highest known number per year.
    Discover {
        /// Years to scan; defaults to the current year.
        years: Vec<i32>,
        /// Stop a year after this many consecutive absences.
        #[arg(long, value_name = "N")]
        auto_stop: Option<usize>,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Print row counts and the status breakdown.
    Stats,
}

fn build_reconciler(
    store: Store,
    config: SyncConfig,
) -> Result<Reconciler<HttpSourceClient>> {
    let client = HttpSourceClient::new(SourceClientConfig {
        base_url: config.api_base.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
    })?;
    Ok(Reconciler::new(store, client, config))
}

/// Flip the cancellation flag on the first Ctrl-C. The run finishes the
/// in-flight posting and exits normally; a second Ctrl-C kills the process.
fn wire_ctrl_c(reconciler: &Reconciler<HttpSourceClient>) {
    let cancel = reconciler.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current posting");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Store::open(&config.database_url).await?;

    match cli.command.unwrap_or(Commands::Reconcile {
        tier: None,
        dry_run: false,
        limit: None,
    }) {
        Commands::Reconcile {
            tier,
            dry_run,
            limit,
        } => {
            let options = ReconcileOptions {
                tier: tier.and_then(Tier::from_number),
                dry_run,
                limit,
            };
            let reconciler = build_reconciler(store, config)?;
            wire_ctrl_c(&reconciler);

            let summary = reconciler.run(&options).await?;
            for report in &summary.tiers {
                println!(
                    "tier {} ({}): {} candidates, {} checked, {} updated, {} status changes, {} awards, {} archived, {} errors, {} skipped",
                    report.tier,
                    report.label,
                    report.stats.total,
                    report.stats.checked,
                    report.stats.updated,
                    report.stats.status_changes,
                    report.stats.awards_added,
                    report.stats.archived,
                    report.stats.errors,
                    report.stats.skipped,
                );
            }
            let totals = summary.totals();
            if summary.dry_run {
                println!(
                    "dry run {}: {} postings would be checked",
                    summary.run_id, totals.would_check
                );
            } else {
                println!(
                    "run {} complete: {} checked, {} updated, {} errors",
                    summary.run_id, totals.checked, totals.updated, totals.errors
                );
            }
        }
        Commands::Discover { years, auto_stop } => {
            let auto_stop = auto_stop.unwrap_or(config.discovery_auto_stop);
            let years = if years.is_empty() {
                vec![chrono::Datelike::year(&chrono::Utc::now())]
            } else {
                years
            };
            let reconciler = build_reconciler(store, config)?;
            wire_ctrl_c(&reconciler);

            for year in years {
                let report = reconciler.discover_year(year, auto_stop).await?;
                println!(
                    "{}: scanned {} from #{}, found {}, {} absent, {} errors{}",
                    report.year,
                    report.scanned,
                    report.started_from,
                    report.found,
                    report.not_found,
                    report.errors,
                    report
                        .highest_found
                        .map(|n| format!(", highest #{n}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Migrate => {
            let applied = store.migrate().await?;
            if applied == 0 {
                println!("schema up to date (version {})", store.schema_version().await?);
            } else {
                println!(
                    "applied {} migration(s); now at version {}",
                    applied,
                    store.schema_version().await?
                );
            }
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("postings:           {}", stats.postings);
            println!("  archived:         {}", stats.archived);
            println!("bids:               {}", stats.bids);
            println!("awards:             {}", stats.awards);
            println!("interested parties: {}", stats.interested_suppliers);
            println!("documents:          {}", stats.documents);
            println!("scrape attempts:    {}", stats.scrape_attempts);
            println!("status transitions: {}", stats.status_transitions);
            if !stats.by_status.is_empty() {
                println!("by status:");
                for (status, count) in &stats.by_status {
                    println!("  {status}: {count}");
                }
            }
        }
    }

    Ok(())
}
