mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use drover_core::coordinator::{Coordinator, CoordinatorConfig};
use drover_core::oracle::cli::{CliOracle, OracleConfig, Provider};
use drover_core::runtime::{AgentConfig, AgentRuntime, GoalBackoffPublisher};
use drover_core::spawn::{LoggingSpawnAdapter, SpawnAdapter, SupervisorSpawnAdapter};
use drover_db::config::DbConfig;
use drover_db::pool;

use config::{ConfigFile, DEFAULT_CONFIG_FILE};

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Run one agent's control loop.
    Agent,
    /// Run the coordinator reconcile loop.
    Orchestrator,
}

#[derive(Parser)]
#[command(name = "drover", about = "Multi-agent orchestration runtime")]
struct Cli {
    /// Process role
    #[arg(long, value_enum)]
    role: Role,

    /// Primary instructions file
    #[arg(long)]
    instructions: PathBuf,

    /// State store URL (overrides DROVER_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Agent identifier (agent role only)
    #[arg(long)]
    agent_name: Option<String>,

    /// Agent role string for task gating; defaults to the agent name
    #[arg(long)]
    agent_role: Option<String>,

    /// Goal identifier for the active DAG (agent role only)
    #[arg(long)]
    goal_id: Option<String>,

    /// Heartbeat directive file (agent role only)
    #[arg(long)]
    heartbeat: Option<PathBuf>,

    /// Agent loop interval in seconds
    #[arg(long, default_value_t = 1.0)]
    loop_interval: f64,

    /// Task lease TTL in seconds
    #[arg(long, default_value_t = 30.0)]
    lease_ttl: f64,

    /// Coordinator poll interval in seconds
    #[arg(long, default_value_t = 5.0)]
    poll_interval: f64,

    /// Directive-file poll interval in seconds
    #[arg(long, default_value_t = 120.0)]
    heartbeat_interval: f64,

    /// Instruction reload interval in seconds
    #[arg(long, default_value_t = 120.0)]
    instruction_interval: f64,

    /// Oracle provider
    #[arg(long)]
    oracle_provider: Option<String>,

    /// Path to the oracle provider CLI
    #[arg(long)]
    oracle_cli: Option<String>,

    /// Additional arguments for the oracle CLI (repeatable)
    #[arg(long, allow_hyphen_values = true)]
    oracle_extra_arg: Vec<String>,

    /// Supervisor binary used to spawn agents
    #[arg(long)]
    supervisor: Option<String>,

    /// Log spawn commands instead of running the supervisor
    #[arg(long)]
    spawn_dry_run: bool,
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_lowercase())),
        )
        .init();
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("--{flag} must be a non-negative number of seconds");
    }
    Ok(Duration::from_secs_f64(value))
}

fn resolve_oracle_config(cli: &Cli, file: &ConfigFile) -> Result<OracleConfig> {
    let provider_name = cli
        .oracle_provider
        .clone()
        .or_else(|| file.oracle.provider.clone())
        .unwrap_or_else(|| "claude".to_owned());
    let provider: Provider = provider_name.parse()?;

    let executable = cli
        .oracle_cli
        .clone()
        .or_else(|| file.oracle.executable.clone())
        .unwrap_or_else(|| provider.default_executable().to_owned());

    let mut oracle_config = OracleConfig::new(provider, executable);
    oracle_config.extra_args = if cli.oracle_extra_arg.is_empty() {
        file.oracle.extra_args.clone()
    } else {
        cli.oracle_extra_arg.clone()
    };
    Ok(oracle_config)
}

/// Oracle flags forwarded to spawned agents so the fleet shares one
/// provider configuration.
fn oracle_passthrough_args(oracle_config: &OracleConfig) -> Vec<String> {
    let provider = match oracle_config.provider {
        Provider::Claude => "claude",
        Provider::Codex => "codex",
    };
    let mut args = vec![
        "--oracle-provider".to_owned(),
        provider.to_owned(),
        "--oracle-cli".to_owned(),
        oracle_config.executable.clone(),
    ];
    for extra in &oracle_config.extra_args {
        args.push("--oracle-extra-arg".to_owned());
        args.push(extra.clone());
    }
    args
}

async fn run_agent(cli: &Cli, db_url: String, oracle_config: OracleConfig) -> Result<()> {
    let (Some(agent_name), Some(goal_id), Some(heartbeat)) =
        (&cli.agent_name, &cli.goal_id, &cli.heartbeat)
    else {
        bail!("agent role requires --agent-name, --goal-id, and --heartbeat");
    };

    let db_pool = pool::open_pool(&DbConfig::new(db_url)).await?;

    let notifier = Arc::new(GoalBackoffPublisher::new(db_pool.clone(), goal_id.clone()));
    let oracle = Arc::new(CliOracle::new(oracle_config).with_notifier(notifier));

    let mut agent_config = AgentConfig::new(
        agent_name.clone(),
        cli.agent_role.clone().unwrap_or_else(|| agent_name.clone()),
        goal_id.clone(),
        cli.instructions.clone(),
        heartbeat.clone(),
    );
    agent_config.loop_interval = seconds(cli.loop_interval, "loop-interval")?;
    agent_config.lease_ttl = seconds(cli.lease_ttl, "lease-ttl")?;
    agent_config.heartbeat_refresh_interval = seconds(cli.heartbeat_interval, "heartbeat-interval")?;
    agent_config.instructions_refresh_interval =
        seconds(cli.instruction_interval, "instruction-interval")?;

    let mut runtime = AgentRuntime::new(db_pool.clone(), oracle, agent_config);
    let cancel = runtime.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down agent");
            cancel.cancel();
        }
    });

    let result = runtime.run(None).await;
    db_pool.close().await;
    result
}

async fn run_orchestrator(
    cli: &Cli,
    db_url: String,
    oracle_config: OracleConfig,
    file: &ConfigFile,
) -> Result<()> {
    let db_pool = pool::open_pool(&DbConfig::new(db_url.clone())).await?;

    let spawner: Arc<dyn SpawnAdapter> = if cli.spawn_dry_run {
        Arc::new(LoggingSpawnAdapter)
    } else {
        let supervisor_bin = cli
            .supervisor
            .clone()
            .or_else(|| file.supervisor.binary.clone())
            .unwrap_or_else(|| "sysg".to_owned());
        Arc::new(SupervisorSpawnAdapter::new(supervisor_bin))
    };

    let mut coordinator_config = CoordinatorConfig::new(cli.instructions.clone(), db_url);
    coordinator_config.poll_interval = seconds(cli.poll_interval, "poll-interval")?;
    coordinator_config.agent_program = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "drover".to_owned());
    coordinator_config.agent_extra_args = oracle_passthrough_args(&oracle_config);

    let oracle = Arc::new(CliOracle::new(oracle_config));
    let mut coordinator = Coordinator::new(db_pool.clone(), oracle, spawner, coordinator_config);
    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down coordinator");
            cancel.cancel();
        }
    });

    let result = coordinator.run(None).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let file = ConfigFile::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    let db_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DROVER_DATABASE_URL").ok())
        .or_else(|| file.store.database_url.clone())
        .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

    let oracle_config = resolve_oracle_config(&cli, &file)?;

    match cli.role {
        Role::Agent => run_agent(&cli, db_url, oracle_config).await,
        Role::Orchestrator => run_orchestrator(&cli, db_url, oracle_config, &file).await,
    }
}
