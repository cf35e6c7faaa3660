//! Joins the network under a random alias, prints the peer table on every
//! change, and exits on Ctrl+C.
//!
//! Local testing note: the loopback interface has multicast disabled by
//! default, so two instances on one machine won't see each other unless
//! you run `sudo ip link set lo multicast on` first.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lansend::config::default_device_model;
use lansend::discovery::{select_interface, DiscoveryEngine};
use lansend::identity::IdentityStore;
use lansend::peers::PeerRegistry;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    alias: Option<String>,
}

fn random_alias() -> String {
    format!("peer-{:04x}", rand::random::<u16>())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let alias = args.alias.unwrap_or_else(random_alias);
    println!("Starting peer discovery as '{alias}'. Press Ctrl+C to exit.");

    let identity = Arc::new(IdentityStore::new(alias, Some(default_device_model()), None));
    let local_ip = select_interface().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    identity.set_bound_address(local_ip, 0);
    let peers = Arc::new(PeerRegistry::new(identity.fingerprint().to_string()));
    let discovery = Arc::new(DiscoveryEngine::new(identity.clone(), peers.clone()));

    discovery.start_listening().await?;
    discovery.start_announcing().await?;
    discovery.start_sweeping(Duration::from_secs(15)).await;

    let mut events = peers.subscribe();
    tokio::spawn(async move {
        while events.recv().await.is_ok() {
            print_table(&peers);
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\nReceived Ctrl+C, shutting down...");
    discovery.shutdown().await;
    Ok(())
}

fn print_table(peers: &PeerRegistry) {
    println!("\nDiscovered peers:");
    println!("{:<20} {:<15} {:<10}", "Alias", "IP", "Port");
    println!("{:-<47}", "");
    for record in peers.snapshot() {
        println!(
            "{:<20} {:<15} {:<10}",
            record.info.alias, record.info.ip, record.info.port
        );
    }
}
