use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use switchyard_agent::{Runtime, StepRegistry};
use switchyard_core::config::SwitchyardConfig;
use switchyard_core::types::{CorrelationId, WorkflowState};

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Topic-routed agent workflow runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml", env = "SWITCHYARD_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every agent and report build errors
    Validate,
    /// List subscribed topics
    Topics,
    /// List registered step types
    Steps,
    /// Publish a state to a topic and wait for the workflow to complete
    Run {
        /// Entry topic name
        topic: String,
        /// Initial state as a JSON object
        #[arg(long, default_value = "{}")]
        state: String,
        /// Correlation id (generated if not provided)
        #[arg(long)]
        correlation_id: Option<String>,
        /// Seconds to wait for completion (defaults to the configured timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchyard=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let load = || {
        SwitchyardConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))
    };

    match cli.command {
        Commands::Steps => {
            let mut registry = StepRegistry::with_builtins();
            if cli.config.exists() {
                for definition in load()?.steps {
                    registry.document(definition);
                }
            }
            for def in registry.definitions() {
                println!("{:<14} {}", def.name, def.description);
            }
        }
        Commands::Validate => {
            let config = load()?;
            let runtime = Runtime::from_config(&config).context("building agents")?;
            println!(
                "{}: {} agent(s) OK",
                cli.config.display(),
                runtime.topics().len()
            );
        }
        Commands::Topics => {
            let config = load()?;
            let runtime = Runtime::from_config(&config)?;
            for topic in runtime.topics() {
                let description = config
                    .agent(topic)
                    .map(|a| a.description.as_str())
                    .unwrap_or_default();
                println!("{:<24} {}", topic, description);
            }
        }
        Commands::Run {
            topic,
            state,
            correlation_id,
            timeout,
        } => {
            let config = load()?;
            let runtime = Runtime::from_config(&config)?;
            let data: serde_json::Value =
                serde_json::from_str(&state).context("parsing --state as JSON")?;
            let correlation_id = correlation_id
                .map(CorrelationId::from)
                .unwrap_or_default();
            let initial = WorkflowState::from_value(correlation_id, data)?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling workflow");
                    on_signal.cancel();
                }
            });

            info!(topic = %topic, correlation_id = %initial.correlation_id, "Starting workflow");
            let result = runtime
                .run_with_cancel(&topic, initial, timeout.map(Duration::from_secs), cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result.to_value())?);
        }
    }

    Ok(())
}
