//! rcp-coding - command line front end for the response coding pipeline
//!
//! Runs one pipeline operation against a workspace database and prints the
//! result as JSON. Ctrl-C cancels the running job at its next chunk boundary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rcp_common::cache::MemoryCache;
use rcp_common::config::{resolve_database_path, TomlConfig, DATABASE_ENV_VAR};
use rcp_common::db::{get_aggregation_threshold, init_database};
use rcp_common::events::{CodingEvent, EventBus};
use rcp_common::{CodingVersion, JobContext, MatchingFlag, MatchingFlags};
use rcp_coding::services::workspace_settings::update_matching_flags;
use rcp_coding::PipelineState;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(name = "rcp-coding")]
#[clap(about = "Duplicate analysis, aggregation, version reset and coder agreement")]
struct Cli {
    /// SQLite database file (overrides RCP_DATABASE and the config file)
    #[clap(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// TOML config file (default: platform config dir)
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report empty responses and duplicate groups
    Analyze {
        #[clap(long)]
        workspace: i64,
        /// Minimum group size (default: last applied aggregation threshold)
        #[clap(long)]
        threshold: Option<i64>,
        #[clap(long, default_value = "1")]
        page: usize,
        #[clap(long, default_value = "50")]
        limit: usize,
    },

    /// Collapse duplicate groups onto their master response
    Aggregate {
        #[clap(long)]
        workspace: i64,
        /// Minimum group size (default: last applied aggregation threshold)
        #[clap(long)]
        threshold: Option<i64>,
    },

    /// Undo an applied aggregation
    RevertAggregation {
        #[clap(long)]
        workspace: i64,
    },

    /// Null a coding version (v2 also resets v3)
    Reset {
        #[clap(long)]
        workspace: i64,
        #[clap(long)]
        version: CodingVersion,
        /// Restrict to these unit names (comma separated)
        #[clap(long, value_delimiter = ',')]
        units: Option<Vec<String>>,
        /// Restrict to these variable ids (comma separated)
        #[clap(long, value_delimiter = ',')]
        variables: Option<Vec<String>>,
    },

    /// Cohen's kappa summary over double-coded responses
    Kappa {
        #[clap(long)]
        workspace: i64,
        /// Plain mean over coder pairs instead of weighting by pair count
        #[clap(long)]
        unweighted: bool,
        /// Count coding jobs that belong to a training
        #[clap(long)]
        include_trainings: bool,
    },

    /// Status distribution per coding version
    Statistics {
        #[clap(long)]
        workspace: i64,
        /// Single version (default: all three)
        #[clap(long)]
        version: Option<CodingVersion>,
        /// List variables still waiting for manual coding instead
        #[clap(long)]
        incomplete: bool,
    },

    /// Replace the workspace's response matching flags
    SetFlags {
        #[clap(long)]
        workspace: i64,
        /// IGNORE_CASE, IGNORE_WHITESPACE, NO_AGGREGATION (omit all to clear)
        flags: Vec<MatchingFlag>,
    },

    /// Create the database schema
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TomlConfig::load(path)?,
        None => TomlConfig::load_default()?,
    };

    let level: tracing::Level = config
        .log_level
        .as_deref()
        .and_then(|l| l.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Starting rcp-coding v{}", env!("CARGO_PKG_VERSION"));

    let db_path = resolve_database_path(cli.database.as_deref(), DATABASE_ENV_VAR, &config);
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let event_bus = EventBus::new(100);
    let state = PipelineState::new(pool, Arc::new(MemoryCache::new()), event_bus.clone())
        .with_cache_ttl(config.cache_ttl());

    let token = CancellationToken::new();
    spawn_cancel_on_ctrl_c(token.clone());
    spawn_progress_logger(&event_bus);

    let job = |operation: &str| {
        JobContext::new(operation)
            .with_events(event_bus.clone())
            .with_cancellation(token.clone())
    };

    match cli.command {
        Command::Analyze {
            workspace,
            threshold,
            page,
            limit,
        } => {
            let outcome = state
                .analyzer()
                .analyze(workspace, threshold, &job("analyze"))
                .await?;
            let cancelled = outcome.is_cancelled();
            let result = outcome.into_inner();
            print_json(&serde_json::json!({
                "cancelled": cancelled,
                "workspace_id": result.workspace_id,
                "threshold": result.threshold,
                "matching_flags": result.matching_flags,
                "aggregation_already_applied": result.aggregation_already_applied,
                "empty_responses": result.page_empty_responses(page, limit),
                "duplicate_groups": result.page_duplicate_groups(page, limit),
            }))?;
        }

        Command::Aggregate {
            workspace,
            threshold,
        } => {
            let threshold = match threshold {
                Some(t) => t,
                None => get_aggregation_threshold(&state.db, workspace).await?,
            };
            let outcome = state
                .aggregation_resolver()
                .apply_aggregation(workspace, threshold, true, &job("aggregate"))
                .await?;
            print_json(&outcome)?;
        }

        Command::RevertAggregation { workspace } => {
            let outcome = state
                .aggregation_resolver()
                .apply_aggregation(workspace, 0, false, &job("revert-aggregation"))
                .await?;
            print_json(&outcome)?;
        }

        Command::Reset {
            workspace,
            version,
            units,
            variables,
        } => {
            let outcome = state
                .version_reset()
                .reset(workspace, version, units, variables, &job("reset"))
                .await?;
            print_json(&outcome)?;
        }

        Command::Kappa {
            workspace,
            unweighted,
            include_trainings,
        } => {
            let summary = state
                .agreement()
                .compute_workspace_summary(workspace, !unweighted, !include_trainings)
                .await?;
            print_json(&summary)?;
        }

        Command::Statistics {
            workspace,
            version,
            incomplete,
        } => {
            let service = state.statistics();
            if incomplete {
                print_json(&service.incomplete_variables(workspace).await?)?;
            } else {
                let versions = match version {
                    Some(v) => vec![v],
                    None => CodingVersion::ALL.to_vec(),
                };
                let mut all = Vec::with_capacity(versions.len());
                for v in versions {
                    all.push(service.get_statistics(workspace, v).await?);
                }
                print_json(&all)?;
            }
        }

        Command::SetFlags { workspace, flags } => {
            let flags: MatchingFlags = flags.into_iter().collect();
            let previous =
                update_matching_flags(&state.db, state.cache.as_ref(), workspace, &flags).await?;
            print_json(&serde_json::json!({ "previous": previous, "current": flags }))?;
        }

        Command::InitDb => {
            info!("Schema ready at {}", db_path.display());
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn spawn_cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next chunk boundary");
            token.cancel();
        }
    });
}

fn spawn_progress_logger(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CodingEvent::JobProgress {
                    operation, percent, ..
                }) => info!(operation = %operation, percent, "Progress"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
