use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, timeout};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use skadium::{
    Keypair, Protocol, TcpTransport, Transport, DEFAULT_C1, DEFAULT_C2, SIGNAL_HANDSHAKE_COMPLETE,
};

#[derive(Parser, Debug)]
#[command(name = "skadium")]
#[command(author, version, about = "S/Kademlia overlay node", long_about = None)]
struct Args {
    /// Address to bind the TCP transport on.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Externally reachable address advertised to peers.
    /// Defaults to the bound address.
    #[arg(short, long)]
    external: Option<String>,

    /// Existing overlay nodes to join through.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Static puzzle difficulty in leading zero bits.
    #[arg(long, default_value_t = DEFAULT_C1)]
    c1: usize,

    /// Dynamic puzzle difficulty in leading zero bits.
    #[arg(long, default_value_t = DEFAULT_C2)]
    c2: usize,

    /// Seconds between routing table reports.
    #[arg(short, long, default_value = "60")]
    report_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(c1 = args.c1, c2 = args.c2, "searching identity puzzles");
    let keys = Keypair::generate(args.c1, args.c2).context("identity puzzle search failed")?;

    let (net, sessions) = TcpTransport::bind(&args.bind)
        .await
        .context("failed to bind transport")?;
    let external = args.external.clone().unwrap_or_else(|| net.local_addr());

    let protocol = Protocol::new(keys, external)
        .with_c1(args.c1)
        .with_c2(args.c2);
    info!(id = %protocol.self_id(), bound = %net.local_addr(), "node online");

    let net: Arc<dyn Transport> = net;
    let _serve = protocol.serve(net.clone(), sessions);

    for addr in &args.bootstrap {
        match net.dial(addr).await {
            Ok(session) => {
                let joined = timeout(
                    Duration::from_secs(5),
                    session.wait_for_signal(SIGNAL_HANDSHAKE_COMPLETE),
                )
                .await;
                match joined {
                    Ok(()) => info!(%addr, "joined through bootstrap peer"),
                    Err(_) => warn!(%addr, "bootstrap handshake timed out"),
                }
            }
            Err(err) => warn!(%addr, error = %err, "bootstrap dial failed"),
        }
    }

    if !args.bootstrap.is_empty() {
        let found = protocol.bootstrap(&net).await;
        info!(discovered = found.len(), "bootstrap lookup complete");
    }

    let mut report = time::interval(Duration::from_secs(args.report_interval));
    report.tick().await; // immediate first tick is uninteresting

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = report.tick() => {
                info!(
                    table = protocol.table().len(),
                    sessions = protocol.peer_count(),
                    "routing report"
                );
            }
        }
    }

    Ok(())
}
