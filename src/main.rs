use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use backserver::config::BackServerConfig;
use backserver::node::BackServer;
use backserver::shutdown::install_shutdown_handler;
use backserver::store::{RedisStore, SharedStore};

#[derive(Parser, Debug)]
#[command(name = "backserver")]
#[command(version)]
#[command(about = "Back-server that competes for task packages on a shared exchange")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a back-server and claim packages until interrupted
    Server(ServerArgs),

    /// Show ready servers and claimed packages
    Status(StatusArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Shared store url
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// JSON file with settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Prefix for this server's generated identity
    #[arg(long)]
    server_prefix: Option<String>,

    /// Key of the shared exchange hash
    #[arg(long)]
    exchange_key: Option<String>,

    /// 0 = one worker per job, >0 = jobs per worker, <0 = fixed worker count
    #[arg(long, allow_hyphen_values = true)]
    balance_ratio: Option<i32>,

    /// Maximum workers added per package (ignored unless positive)
    #[arg(long, allow_hyphen_values = true)]
    max_workers: Option<i32>,

    /// Seconds per simulated job cycle
    #[arg(long)]
    step_delay_secs: Option<f64>,

    /// Write job progress every N cycles
    #[arg(long)]
    progress_granularity: Option<u32>,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ReadyServerOutput {
    server: String,
    registered_at: String,
}

#[derive(Serialize)]
struct ClaimOutput {
    token: String,
    server: String,
}

#[derive(Serialize)]
struct StatusOutput {
    exchange_pending: usize,
    ready_servers: Vec<ReadyServerOutput>,
    claims: Vec<ClaimOutput>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Status(status_args) => run_status(status_args).await,
    }
}

fn load_config(args: &StoreArgs) -> Result<BackServerConfig, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => BackServerConfig::from_json_file(path)?,
        None => BackServerConfig::default(),
    };
    Ok(config)
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = load_config(&args.store)?;
    if let Some(prefix) = args.server_prefix {
        config.server_prefix = prefix;
    }
    if let Some(key) = args.exchange_key {
        config.exchange_key = key;
    }
    if let Some(ratio) = args.balance_ratio {
        config.balance_ratio = ratio;
    }
    if let Some(max) = args.max_workers {
        config.max_workers_per_server = max;
    }
    if let Some(secs) = args.step_delay_secs {
        config.step_delay = std::time::Duration::try_from_secs_f64(secs)?;
    }
    if let Some(every) = args.progress_granularity {
        config.progress_granularity = every;
    }
    config.validate()?;

    let shutdown = install_shutdown_handler();
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&args.store.redis_url).await?);

    let server = BackServer::new(config, store);
    tracing::info!(server = %server.identity(), "Back-server identity generated");
    server.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Status
// =============================================================================

async fn run_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.store)?;
    let store = RedisStore::connect(&args.store.redis_url).await?;

    let exchange_pending = store.hgetall(&config.exchange_key).await?.len();
    let mut ready_servers: Vec<ReadyServerOutput> = store
        .hgetall(&config.readiness_key)
        .await?
        .into_iter()
        .map(|(server, registered_at)| ReadyServerOutput {
            server,
            registered_at,
        })
        .collect();
    ready_servers.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
    let claims: Vec<ClaimOutput> = store
        .hgetall(&config.ownership_audit_key)
        .await?
        .into_iter()
        .map(|(token, server)| ClaimOutput { token, server })
        .collect();

    let status = StatusOutput {
        exchange_pending,
        ready_servers,
        claims,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => {
            println!("Exchange: {} package(s) waiting", status.exchange_pending);
            println!();
            println!("{:<50} {}", "READY SERVER", "REGISTERED AT");
            for s in &status.ready_servers {
                println!("{:<50} {}", s.server, s.registered_at);
            }
            println!();
            println!("{:<40} {}", "CLAIM TOKEN", "SERVER");
            for c in &status.claims {
                println!("{:<40} {}", c.token, c.server);
            }
        }
    }

    Ok(())
}
