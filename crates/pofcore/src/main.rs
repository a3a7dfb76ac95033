//! # PoF Core binary
//!
//! Runs a formulator node against the in-memory reference chain, and
//! provides key management for setting one up.

use anyhow::{Context, Result};
use clap::Parser;
use pofcore::Node;
use pofcore_config::Config;
use pofcore_crypto::ecdsa::PrivateKey;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PoF Core node and tools
#[derive(Parser, Debug)]
#[command(name = "pofcore")]
#[command(version)]
#[command(about = "PoF Core - block production driven by observer co-signing")]
struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the formulator node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "pofcore.toml")]
        config: String,
    },

    /// Generate a fresh key and print its identities
    Keygen,
}

fn init_logging(verbose: u8, config_level: &str) {
    let default = match verbose {
        0 => config_level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            let config = Config::load(&config)
                .with_context(|| format!("loading configuration from {config}"))?;
            init_logging(cli.verbose, &config.logging.level);

            let node = Node::from_config(&config).context("wiring node")?;
            node.init().context("initializing node")?;

            info!(bind = %config.network.bind_address, "starting pofcore");
            node.run().await.context("running node")?;
            Ok(())
        }
        Commands::Keygen => {
            init_logging(cli.verbose, "warn");
            let key = PrivateKey::random();
            let public = key.public_key();
            println!("private key: 0x{}", hex::encode(key.to_bytes()));
            println!("public hash: {}", public.public_hash());
            println!("address:     {}", public.to_address());
            Ok(())
        }
    }
}
