//! CLI command definitions for eval-forge.
//!
//! The binary wires the engine to its production collaborators: the
//! PostgreSQL store when `DATABASE_URL` is set (the in-memory store
//! otherwise), the OpenAI-compatible chat and batch clients, and an optional
//! token-bucket rate limiter.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{EngineConfig, EngineContext};
use crate::llm::{OpenAiBatchClient, OpenAiChatClient};
use crate::metrics::{export_metrics, init_metrics};
use crate::models::{model_spec, Provider};
use crate::pipeline::{standard_registry, EvidenceRepository, ExperimentRepository};
use crate::policy::{PolicyLayers, PolicyScope};
use crate::ratelimit::{RateLimits, TokenBucketLimiter};
use crate::scheduler::{LoopConfig, Scheduler, SchedulerLoop};
use crate::storage::{MemoryStore, PgStore, Store};

/// LLM-call orchestration and scheduling engine.
#[derive(Parser)]
#[command(name = "eval-forge")]
#[command(about = "Schedule LLM batch and job work for evaluation pipelines")]
#[command(version)]
#[command(
    long_about = "eval-forge drives multi-stage evaluation pipelines by routing LLM calls to provider batches or synchronous jobs.\n\nExample usage:\n  eval-forge migrate\n  eval-forge scheduler\n  eval-forge policy --model gpt-4.1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply database migrations.
    Migrate(MigrateArgs),

    /// Run a single scheduler tick.
    Tick(TickArgs),

    /// Run the scheduler loop until Ctrl-C.
    Scheduler(SchedulerArgs),

    /// Print the resolved policy for a provider and model as YAML.
    Policy(PolicyArgs),
}

#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// List applied migrations instead of applying pending ones.
    #[arg(long)]
    pub status: bool,
}

#[derive(Parser, Debug)]
pub struct TickArgs {
    /// Print Prometheus metrics after the tick.
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Parser, Debug)]
pub struct SchedulerArgs {
    /// Longest sleep between ticks, in seconds.
    #[arg(long, default_value = "30")]
    pub max_idle_secs: u64,

    /// Seconds to wait for the in-progress tick on shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Parser, Debug)]
pub struct PolicyArgs {
    /// Provider layer to apply (derived from --model when omitted).
    #[arg(long)]
    pub provider: Option<Provider>,

    /// Model layer to apply.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Team layer to apply (defaults to EVAL_FORGE_TEAM).
    #[arg(long)]
    pub team: Option<String>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    init_metrics()?;

    match cli.command {
        Commands::Migrate(args) => run_migrate_command(&config, args).await,
        Commands::Tick(args) => run_tick_command(config, args).await,
        Commands::Scheduler(args) => run_scheduler_command(config, args).await,
        Commands::Policy(args) => run_policy_command(&config, args),
    }
}

async fn run_migrate_command(config: &EngineConfig, args: MigrateArgs) -> anyhow::Result<()> {
    let Some(url) = config.database_url.as_deref() else {
        anyhow::bail!("DATABASE_URL must be set to run migrations");
    };
    let store = PgStore::connect(url, config.db_max_connections).await?;
    if args.status {
        let (applied, pending) = store.migration_status().await?;
        for migration in &applied {
            println!("{}  {}", migration.name, migration.applied_at.to_rfc3339());
        }
        println!("{} applied, {} pending", applied.len(), pending);
        return Ok(());
    }
    let applied = store.run_migrations().await?;
    info!(applied, "Migrations complete");
    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn run_tick_command(config: EngineConfig, args: TickArgs) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    let report = Scheduler::new(ctx).tick(chrono::Utc::now()).await?;
    if !report.ran {
        println!("Scheduler lock held by another tick; nothing done");
    } else {
        println!(
            "launched={} polled={} jobs_run={} submitted={} started={} skipped={} errors={}",
            report.launched,
            report.polled,
            report.jobs_run,
            report.submitted,
            report.started,
            report.skipped,
            report.errors
        );
    }
    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_scheduler_command(config: EngineConfig, args: SchedulerArgs) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    Scheduler::new(ctx.clone())
        .ensure_scheduler(chrono::Utc::now())
        .await?;

    let loop_config = LoopConfig::default()
        .with_max_idle(std::time::Duration::from_secs(args.max_idle_secs))
        .with_shutdown_timeout(std::time::Duration::from_secs(args.shutdown_timeout_secs));
    let mut scheduler = SchedulerLoop::new(ctx, loop_config);
    scheduler.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping scheduler");
    scheduler.shutdown().await?;

    let stats = scheduler.stats();
    info!(
        ticks_run = stats.ticks_run,
        ticks_skipped = stats.ticks_skipped,
        tick_errors = stats.tick_errors,
        "Scheduler stopped"
    );
    Ok(())
}

fn run_policy_command(config: &EngineConfig, args: PolicyArgs) -> anyhow::Result<()> {
    let layers = match &config.policy_file {
        Some(path) => PolicyLayers::from_file(path)?,
        None => PolicyLayers::default(),
    };

    let mut scope = PolicyScope::new();
    if let Some(team) = args.team.or_else(|| config.team.clone()) {
        scope = scope.with_team(team);
    }
    let provider = match (args.provider, args.model.as_deref()) {
        (Some(provider), _) => Some(provider),
        (None, Some(model)) => Some(model_spec(model)?.provider),
        (None, None) => None,
    };
    if let Some(provider) = provider {
        scope = scope.with_provider(provider);
    }
    if let Some(model) = args.model {
        scope = scope.with_model(model);
    }

    let policy = layers.resolve(&scope)?;
    print!("{}", serde_yaml::to_string(&policy)?);
    Ok(())
}

/// Builds the engine context from configuration and the environment.
pub async fn build_context(config: EngineConfig) -> anyhow::Result<Arc<EngineContext>> {
    let (store, evidence, experiments): (
        Arc<dyn Store>,
        Arc<dyn EvidenceRepository>,
        Arc<dyn ExperimentRepository>,
    ) = match config.database_url.as_deref() {
        Some(url) => {
            let pg = Arc::new(PgStore::connect(url, config.db_max_connections).await?);
            (pg.clone(), pg.clone(), pg)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            let memory = Arc::new(MemoryStore::new());
            (memory.clone(), memory.clone(), memory)
        }
    };

    let registry = standard_registry(evidence, experiments);
    let chat = Arc::new(OpenAiChatClient::from_env()?);
    let batch_client = Arc::new(OpenAiBatchClient::from_env()?);

    let mut ctx = EngineContext::new(store, registry, chat, batch_client);
    if let Some(path) = &config.rate_limits_file {
        let limits = RateLimits::from_file(path)?;
        ctx = ctx.with_limiter(Arc::new(TokenBucketLimiter::new(limits)));
        info!(path = %path.display(), "Loaded rate limits");
    }
    Ok(Arc::new(ctx.with_config(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_policy_args() {
        let cli = Cli::try_parse_from([
            "eval-forge",
            "policy",
            "--model",
            "gpt-4.1",
            "--team",
            "research",
        ])
        .unwrap();
        match cli.command {
            Commands::Policy(args) => {
                assert_eq!(args.model.as_deref(), Some("gpt-4.1"));
                assert_eq!(args.team.as_deref(), Some("research"));
                assert!(args.provider.is_none());
            }
            _ => panic!("expected policy command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_migrate_status() {
        let cli = Cli::try_parse_from(["eval-forge", "migrate", "--status"]).unwrap();
        match cli.command {
            Commands::Migrate(args) => assert!(args.status),
            _ => panic!("expected migrate command"),
        }
    }

    #[test]
    fn test_parse_scheduler_defaults() {
        let cli = Cli::try_parse_from(["eval-forge", "-l", "debug", "scheduler"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Scheduler(args) => {
                assert_eq!(args.max_idle_secs, 30);
                assert_eq!(args.shutdown_timeout_secs, 60);
            }
            _ => panic!("expected scheduler command"),
        }
    }
}
