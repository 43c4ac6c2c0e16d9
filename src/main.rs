//! `agent-relay` binary entry point.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use agent_relay::broker::Broker;
use agent_relay::config::RelayConfig;

#[derive(Parser)]
#[command(name = "agent-relay", version, about = "Local multi-agent messaging fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker in the foreground.
    Serve {
        /// Socket path (default: <cwd>/.agent-relay/relay.sock).
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Durable state directory; enables session/channel/message
        /// journaling so resume survives a broker restart.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { socket, state_dir } => {
            let mut config = RelayConfig::load();
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            if let Some(state_dir) = state_dir {
                config.state_dir = Some(state_dir);
            }

            let handle = Broker::start(config).await?;
            log::info!("broker ready on {}", handle.socket_path().display());

            let trigger = handle.shutdown_trigger();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("interrupt received, shutting down");
                    let _ = trigger.send(agent_relay::broker::BrokerEvent::Shutdown);
                }
            });

            handle.wait().await;
        }
    }

    Ok(())
}
