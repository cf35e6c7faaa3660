//! CLI entry point: starts an agent that announces itself, accepts
//! incoming transfers (optionally unattended), and can push files to an
//! already-discovered peer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lansend::config::AgentConfig;
use lansend::consent::{AutoAcceptConsentProvider, AutoDeclineConsentProvider, UserConsentProvider};
use lansend::coordinator::TransferCoordinator;

#[derive(Parser)]
#[command(name = "lansend", about = "LAN file transfer agent")]
struct Cli {
    #[arg(long)]
    alias: Option<String>,

    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Accept every incoming transfer without prompting.
    #[arg(long)]
    auto_accept: bool,

    /// Decline every incoming transfer. Mutually pointless with --auto-accept
    /// but harmless: the last flag parsed by clap wins if both are given.
    #[arg(long)]
    auto_decline: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until interrupted (default if no subcommand is given).
    Serve,
    /// Push one or more files to an already-discovered peer, then exit.
    Send {
        #[arg(long)]
        fingerprint: String,
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = AgentConfig::default();
    if let Some(alias) = cli.alias {
        config.alias = alias;
    }
    config.http_port = cli.port;
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }

    let consent: Arc<dyn UserConsentProvider> = if cli.auto_decline {
        Arc::new(AutoDeclineConsentProvider)
    } else if cli.auto_accept {
        Arc::new(AutoAcceptConsentProvider)
    } else {
        log::warn!("no consent policy selected, defaulting to auto-decline (fail closed)");
        Arc::new(AutoDeclineConsentProvider)
    };

    let (coordinator, port) = TransferCoordinator::start(config, consent).await?;
    log::info!(
        "agent fingerprint {} bound on port {port}",
        coordinator.identity().fingerprint()
    );

    match cli.command {
        Some(Command::Send { fingerprint, files }) => {
            // Give the discovery loop a moment to populate the peer table
            // before looking the target up.
            tokio::time::sleep(Duration::from_secs(2)).await;
            let session_id = coordinator.send_files(&fingerprint, &files).await?;
            log::info!("transfer {session_id} complete");
        }
        Some(Command::Serve) | None => {
            tokio::signal::ctrl_c().await?;
            log::info!("shutting down");
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
