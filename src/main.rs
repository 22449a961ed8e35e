use clap::{Parser, Subcommand};
use netweave::controller::{Controller, ServerConfig};
use netweave::mq::NullBroker;
use netweave::store::MemoryStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, trace};

#[derive(Parser, Debug)]
#[command(name = "netweave")]
#[command(about = "netweave manages WireGuard-based mesh overlay networks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the netweave control plane
    Run {
        /// Path to the server configuration file
        #[arg(long, default_value = "config.toml")]
        config: String,
    },
    /// Shows the version of the netweave control plane
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_controller(&config).await,
        Commands::Version => show_version(),
    }
}

async fn run_controller(
    config_path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let config = ServerConfig::load_or_generate(config_path)?;
    info!("I am {}", config.server_id);

    // the concrete KV driver and MQTT client are deployment concerns;
    // this binary wires the in-process defaults
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(NullBroker);
    let controller = Controller::start(config, store, broker);

    tokio::select! {
        biased;
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
                let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Shutdown initiated via SIGTERM.");
                    }
                    _ = sigint.recv() => {
                        info!("Shutdown initiated via SIGINT.");
                    }
                }
            }
            #[cfg(not(unix))]
            {
                signal::ctrl_c().await?;
                info!("Shutdown initiated via Ctrl+C.");
            }
            Ok::<_, std::io::Error>(())
        } => {
            controller.shutdown();
        }
        _ = controller.cancelled() => {
            trace!("Controller cancelled.");
        }
    }

    Ok(())
}

fn show_version() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    println!("netweave {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
