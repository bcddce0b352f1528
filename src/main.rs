use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use libri::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "librarian")]
#[command(author, version, about = "Peer-to-peer content-addressed document network node")]
struct Args {
    /// Address to bind the QUIC endpoint.
    #[arg(short, long, default_value = "0.0.0.0:20100")]
    bind: SocketAddr,

    /// Address advertised to peers; defaults to the bind address.
    #[arg(short, long)]
    public_addr: Option<SocketAddr>,

    /// Human-readable node name shared with peers.
    #[arg(short, long, default_value = "librarian")]
    name: String,

    /// Directory holding all node state.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bootstrap peers (IP:PORT), may repeat.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Startup(e)) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(e)) => {
            error!(error = %e, "runtime failure");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run(args: Args) -> Result<(), RunError> {
    let mut config = Config::local(&args.data_dir);
    config.public_name = args.name;
    config.local_addr = args.bind;
    config.public_addr = args.public_addr.unwrap_or(args.bind);

    let node = Node::start(config).await.map_err(RunError::Startup)?;
    info!(self_id = %node.peer_id(), addr = %node.local_addr(), "node started");

    if !args.bootstrap.is_empty() {
        match node.bootstrap(&args.bootstrap).await {
            Ok(n) => info!(n_peers = n, "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| RunError::Runtime(e.into()))?;
    info!("received shutdown signal, stopping gracefully");
    node.shutdown().await;
    Ok(())
}
