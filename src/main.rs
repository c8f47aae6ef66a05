use alloy::primitives::keccak256;
use clap::{Parser, Subcommand};
use cnc_agent::config::{AgentConfig, LoggingConfig};
use cnc_agent::error::{AgentError, Result};
use cnc_agent::identity::HostFacts;
use cnc_agent::node::{ensure_node_running, NodeEndpoint};
use cnc_agent::shutdown::{install_signal_handlers, GracefulShutdown};
use cnc_agent::Agent;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cnc-agent")]
#[command(author, version, about = "Ledger-coordinated command agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: config/default.toml + config/$CNC_ENV.toml)
    #[arg(short, long, env = "CNC_CONFIG")]
    config: Option<PathBuf>,

    /// Working directory for relative paths (chain data, logs, ABI)
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node if managed, register, and execute commands until stopped
    Run,
    /// Register with the coordinator and exit
    Register,
    /// Print this host's fingerprint and registration id hash
    Fingerprint,
    /// Validate the configuration and print it with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(dir) = &cli.base_dir {
        std::env::set_current_dir(dir)?;
    }

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Fingerprint => {
            let facts = HostFacts::collect();
            let fingerprint = facts.fingerprint();
            println!("{:#?}", facts);
            println!("fingerprint: 0x{}", hex::encode(&fingerprint));
            println!("id hash:     {}", keccak256(&fingerprint));
            Ok(())
        }
        Commands::CheckConfig => {
            let config = load_config(&cli)?;
            config.validate()?;
            config.contract.load_abi()?;
            println!("{:#?}", config);
            println!("Configuration OK");
            Ok(())
        }
        Commands::Register => {
            let config = load_config(&cli)?;
            init_logging(&config.logging);
            let (agent, mut node) = start(config).await?;

            let shutdown = Arc::new(GracefulShutdown::with_defaults());
            install_signal_handlers(shutdown.clone());

            let result = agent.register(&shutdown).await;
            node.shutdown().await;
            result?;

            let state = agent.session().lock().await;
            println!("{}", serde_json::to_string_pretty(&*state)?);
            Ok(())
        }
        Commands::Run => {
            let config = load_config(&cli)?;
            init_logging(&config.logging);
            run(config).await
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    let (agent, mut node) = start(config).await?;

    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    install_signal_handlers(shutdown.clone());

    let result = agent.run(&shutdown).await;
    node.shutdown().await;

    match result {
        Ok(stats) => {
            info!(stats = %serde_json::to_string(&stats)?, "Agent stopped");
            Ok(())
        }
        Err(AgentError::Cancelled) => {
            info!("Stopped before registration completed");
            Ok(())
        }
        Err(e) => {
            error!(disposition = %e.disposition(), "Agent failed: {}", e);
            Err(e)
        }
    }
}

async fn start(config: AgentConfig) -> Result<(Agent, NodeEndpoint)> {
    config.validate()?;
    info!("Starting cnc-agent in {} mode", config.op_mode);

    let node = ensure_node_running(&config).await?;
    if let Some(pid) = node.pid() {
        info!(pid, "Managed node running");
    }

    let agent = Agent::connect(config)?;
    info!(
        fingerprint = %hex::encode(agent.identity().machine_fingerprint()),
        "Agent address {}",
        agent.identity().address()
    );
    Ok((agent, node))
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let config = match &cli.config {
        Some(path) => AgentConfig::load_file(path)?,
        None => AgentConfig::load()?,
    };
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},cnc_agent=debug", logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
