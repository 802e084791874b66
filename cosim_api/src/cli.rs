//! Command-line entry point for simulator processes.
//!
//! A simulator binary calls [`start_simulation`] from `main`. By default it
//! dials the world at the given address (cmd mode, where the world spawned
//! it); with `--server` it listens there instead (connect mode).

use crate::error::ApiError;
use crate::server::{serve_connect, serve_listener};
use crate::simulator::Simulator;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Arguments understood by every simulator process.
#[derive(Parser, Debug, Clone)]
#[command(about = "Cosim simulator process", long_about = None)]
pub struct ApiArgs {
    /// World address (host:port)
    pub addr: String,

    /// Listen on `addr` and wait for the world to connect
    #[arg(short, long)]
    pub server: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Installs a stderr `tracing` subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Tracing subscriber already installed");
    }
}

/// Runs `sim` according to `args` on the current runtime.
pub async fn run_simulation(sim: Box<dyn Simulator>, args: &ApiArgs) -> Result<(), ApiError> {
    if args.server {
        let listener = TcpListener::bind(&args.addr).await?;
        info!(addr = %listener.local_addr()?, "Waiting for world");
        serve_listener(sim, listener).await
    } else {
        serve_connect(sim, &args.addr).await
    }
}

/// Parses the process arguments, sets up logging and a runtime, and serves
/// `sim` until the world stops it.
pub fn start_simulation(sim: Box<dyn Simulator>) -> Result<(), ApiError> {
    let args = ApiArgs::parse();
    init_logging(if args.verbose { Level::DEBUG } else { Level::INFO });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_simulation(sim, &args))
}
