use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;

// Stable across releases.
const EXIT_INVALID_CONFIG: i32 = 3;
const EXIT_UNDEFINED: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "flagrelay")]
#[command(version)]
#[command(about = "Feature-flag edge cache and synchronizer", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay: mirror upstream flag state and serve SDK traffic
    Serve {
        /// Path to the relay.toml configuration file
        #[arg(short = 'c', long = "config", default_value = "relay.toml")]
        config: String,

        /// Listen port (overrides the config file)
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Listen hostname (overrides the config file)
        #[arg(long = "hostname")]
        hostname: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Args::parse();
    match cli.cmd {
        Command::Serve {
            config,
            port,
            hostname,
        } => {
            if let Err(err) = server::run_serve(&config, port, hostname).await {
                eprintln!("{err}");
                if err.is_config() {
                    process::exit(EXIT_INVALID_CONFIG);
                }
                process::exit(EXIT_UNDEFINED);
            }
        }
    }
}
