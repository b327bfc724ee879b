mod config;
mod sim;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the in-memory delivery simulation (default)
    Run,
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("TEMPO_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match DaemonConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::PrintConfig => match config.to_toml() {
            Ok(rendered) => print!("{rendered}"),
            Err(err) => {
                error!("failed to render config: {err}");
                std::process::exit(1);
            }
        },
        Commands::Run => {
            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    on_signal.cancel();
                }
            });

            info!(nodes = config.sim.nodes, "starting tempo simulation");
            let report = sim::run(config, shutdown).await;
            if report.timed_out {
                std::process::exit(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["tempo-daemon"]).expect("no args");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["tempo-daemon", "run"]).expect("run");
        assert!(matches!(cli.command, Some(Commands::Run)));

        let cli = Cli::try_parse_from(["tempo-daemon", "--config", "tempo.toml", "print-config"])
            .expect("print-config");
        assert!(matches!(cli.command, Some(Commands::PrintConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("tempo.toml")));

        assert!(Cli::try_parse_from(["tempo-daemon", "settings"]).is_err());
    }
}
