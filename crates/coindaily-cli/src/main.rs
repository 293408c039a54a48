use clap::{Parser, Subcommand};
use coindaily_orchestrator::{FileStateStore, Orchestrator, OrchestratorConfig, SystemClock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser)]
#[command(name = "coindaily", about = "CoinDaily AI agent orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "coindaily.toml")]
    config: PathBuf,

    /// Preset used when the config file does not exist
    /// (production, development, test)
    #[arg(short, long, default_value = "development")]
    env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until Ctrl-C
    Serve {
        /// State directory (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Process a batch of tasks with mock agents and print the metrics
    Simulate {
        /// Number of tasks to submit
        #[arg(short = 'n', long, default_value_t = 60)]
        tasks: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CoinDailyConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    orchestrator: OrchestratorConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl CoinDailyConfig {
    fn preset(env: &str) -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::for_environment(env),
        }
    }
}

/// Read `path` if it exists, otherwise fall back to the `env` preset.
async fn load_config(path: &Path, env: &str) -> anyhow::Result<CoinDailyConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        info!(path = %path.display(), env, "Config file not found, using preset");
        return Ok(CoinDailyConfig::preset(env));
    }
    let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    let config: CoinDailyConfig = toml::from_str(&config_str)?;
    config.orchestrator.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config, &cli.env).await?;

    match cli.command {
        Commands::Serve { data_dir } => {
            let data_dir = data_dir.unwrap_or(config.data_dir);
            let store = FileStateStore::new(data_dir.join("state"))
                .await?
                .with_alert_capacity(config.orchestrator.monitoring.alert_history);
            let store = Arc::new(store);
            let orchestrator =
                Orchestrator::with_parts(config.orchestrator, store, Arc::new(SystemClock))?;
            orchestrator.start().await?;
            info!(data_dir = %data_dir.display(), "CoinDaily orchestrator running");

            let mut events = orchestrator.subscribe();
            let event_log = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => info!(
                            kind = ?event.kind,
                            severity = ?event.severity,
                            data = %event.data,
                            "Orchestrator event"
                        ),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event log lagging");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            orchestrator.shutdown().await?;
            event_log.abort();
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Simulate { tasks } => {
            let report = simulate::run(config.orchestrator, tasks).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use coindaily_orchestrator::AgentType;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["coindaily", "--env", "production", "simulate", "-n", "5"]).unwrap();
        assert_eq!(cli.env, "production");
        assert!(matches!(cli.command, Commands::Simulate { tasks: 5 }));

        let cli = Cli::try_parse_from(["coindaily", "serve", "--data-dir", "/tmp/cd"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("coindaily.toml"));
        match cli.command {
            Commands::Serve { data_dir } => assert_eq!(data_dir, Some(PathBuf::from("/tmp/cd"))),
            _ => panic!("expected serve"),
        }
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_preset() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml"), "test").await.unwrap();
        assert_eq!(config.orchestrator, OrchestratorConfig::testing());
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[tokio::test]
    async fn toml_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coindaily.toml");
        let preset = CoinDailyConfig::preset("production");
        tokio::fs::write(&path, toml::to_string_pretty(&preset).unwrap())
            .await
            .unwrap();

        let loaded = load_config(&path, "development").await.unwrap();
        assert_eq!(loaded, preset);
        assert!(loaded
            .orchestrator
            .queue(AgentType::Moderation)
            .is_some_and(|q| q.name == "moderation_queue"));
    }

    #[tokio::test]
    async fn invalid_file_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("coindaily.toml");
        let mut preset = CoinDailyConfig::preset("test");
        preset.orchestrator.performance.max_concurrent_tasks = 0;
        tokio::fs::write(&path, toml::to_string_pretty(&preset).unwrap())
            .await
            .unwrap();
        assert!(load_config(&path, "test").await.is_err());
    }
}
