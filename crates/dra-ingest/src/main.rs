//! DRA Ingest - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use dra_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use dra_ingest::{
    config::PipelineConfig,
    http::build_client,
    orchestrator::{Orchestrator, RunSummary},
    sources::{self, LandedData, NoLandedData, Source, SourceContext, SourceSpec, REGISTRY},
    store::{create_pool, health_check, PgRunRecorder, PgStagedUpsertLoader},
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extract raw DeFi data from public APIs and land it in PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "dra-ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source to run; repeat for several, or `all`
    #[arg(short, long = "source", value_name = "NAME")]
    sources: Vec<String>,

    /// Extract and validate without loading or auditing
    #[arg(long)]
    dry_run: bool,

    /// Run sources concurrently instead of one after another
    #[arg(long)]
    concurrent: bool,

    /// Cancel everything still running after this many seconds
    #[arg(long, value_name = "SECS")]
    deadline_secs: Option<u64>,

    /// Print registered sources and exit
    #[arg(long)]
    list_sources: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("dra-ingest")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = init_logging(&log_config).unwrap_or_else(|e| {
        eprintln!("Warning: logging disabled: {:#}", e);
        None
    });

    if cli.list_sources {
        print_sources();
        return ExitCode::SUCCESS;
    }

    match run(&cli).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.has_failures() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: &Cli) -> Result<RunSummary> {
    let mut config = PipelineConfig::load()?;
    if cli.concurrent {
        config.run.concurrent = true;
    }
    if cli.deadline_secs.is_some() {
        config.run.deadline_secs = cli.deadline_secs;
    }
    let config = Arc::new(config);

    let selected = sources::select(&cli.sources)?;
    let cancel = CancellationToken::new();
    spawn_cancel_watch(cancel.clone(), config.deadline());

    let client = build_client(&config.http)?;

    let orchestrator = if cli.dry_run {
        let landed: Arc<dyn LandedData> = match connect(&config).await {
            Ok(pool) => Arc::new(PgStagedUpsertLoader::new(pool, &config.database.schema)),
            Err(e) => {
                warn!(error = %e, "Database unreachable, dry run continues without landed data");
                Arc::new(NoLandedData)
            }
        };
        let ctx = SourceContext::new(config.clone(), client, cancel.clone(), landed);
        Orchestrator::dry_run(build_sources(&selected, &ctx)?)
    } else {
        let pool = connect(&config).await.context("Could not reach the landing database")?;
        let loader = Arc::new(
            PgStagedUpsertLoader::new(pool.clone(), &config.database.schema)
                .with_cancellation(cancel.clone()),
        );
        let recorder = Arc::new(PgRunRecorder::new(pool, &config.database.schema));
        let ctx = SourceContext::new(config.clone(), client, cancel.clone(), loader.clone());
        Orchestrator::new(
            build_sources(&selected, &ctx)?,
            loader,
            recorder,
        )
    };

    Ok(orchestrator
        .concurrent(config.run.concurrent)
        .with_cancellation(cancel)
        .run()
        .await)
}

fn build_sources(selected: &[&'static SourceSpec], ctx: &SourceContext) -> Result<Vec<Box<dyn Source>>> {
    selected
        .iter()
        .map(|spec| {
            spec.build(ctx)
                .with_context(|| format!("Could not set up source '{}'", spec.name))
        })
        .collect()
}

async fn connect(config: &PipelineConfig) -> Result<sqlx::PgPool> {
    let pool = create_pool(&config.database).await?;
    health_check(&pool).await?;
    Ok(pool)
}

/// Fire `cancel` on Ctrl-C or when the run deadline passes
fn spawn_cancel_watch(cancel: CancellationToken, deadline: Option<Duration>) {
    tokio::spawn(async move {
        let deadline_elapsed = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                    return;
                }
                warn!("Interrupted, cancelling run");
            }
            _ = deadline_elapsed => {
                warn!(deadline_secs = deadline.map(|d| d.as_secs()), "Run deadline reached, cancelling");
            }
        }
        cancel.cancel();
    });
}

fn print_sources() {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Source", "Table", "Conflict key", "Rate (rps)", "Description"]);

    for spec in REGISTRY {
        table.add_row(vec![
            spec.name.to_string(),
            spec.target_table.to_string(),
            spec.conflict_key.join(", "),
            format!("{}", spec.rate_limit_rps),
            spec.description.to_string(),
        ]);
    }
    println!("{}", table);
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Source", "Status", "Extracted", "Loaded", "Provenance", "Error"]);

    for outcome in &summary.outcomes {
        table.add_row(vec![
            outcome.source.clone(),
            outcome.state.to_string(),
            outcome.rows_extracted.to_string(),
            outcome.rows_loaded.to_string(),
            outcome.provenance.to_string(),
            outcome.error.clone().unwrap_or_default(),
        ]);
    }

    println!("{}", table);
    info!(
        elapsed_ms = summary.elapsed_ms as u64,
        dry_run = summary.dry_run,
        failed = summary.has_failures(),
        "Run complete"
    );
}
