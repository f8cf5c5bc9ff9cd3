//! directord — the deployment director daemon.
//!
//! # Usage
//!
//! ```text
//! directord run --config /etc/director/director.toml
//! directord default-config > director.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use director_core::DirectorConfig;

#[derive(Parser)]
#[command(name = "directord", about = "Deployment director daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the director: API server, worker pool and sweepers.
    Run {
        /// director.toml to load. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured API port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => DirectorConfig::from_file(&path)?,
                None => DirectorConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            directord::telemetry::init(&config.logging)?;
            directord::serve(config).await
        }
        Command::DefaultConfig => {
            print!("{}", DirectorConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}
