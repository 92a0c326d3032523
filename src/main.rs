//! Gateway entry-point.
//!
//! 1. Parse the backend selection and `config.json`.
//! 2. Initialise tracing.
//! 3. Build the chain adapter, subscription state, and height poller
//!    (fatal if the initial upstream height cannot be obtained).
//! 4. Serve WebSocket subscriptions and HTTP JSON-RPC until Ctrl-C, then
//!    cancel everything through a shared token.

use chaingate::adapters::{ChainAdapter, EvmAdapter, SolanaAdapter, TonAdapter, TronAdapter};
use chaingate::config::Config;
use chaingate::poller::run_height_poller;
use chaingate::rate_limiter::UpstreamLimiter;
use chaingate::server::{rpc, ws, AppState};
use chaingate::subscriptions::{run_sweeper, ContractInterestSet, SubscriptionTable};
use chaingate::types::Backend;
use clap::Parser;
use eyre::{eyre, WrapErr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "chaingate", about = "JSON-RPC + WebSocket gateway over chain indexers")]
struct Cli {
    /// Backend to serve: hardhat | ankr | solana | tron | toncenter
    backend: String,
    /// Path to the configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("ethers_providers=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("chaingate=info".parse().unwrap());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = Backend::from_str(&cli.backend).map_err(|e| eyre!(e))?;
    let config = Config::load(&cli.config)
        .wrap_err_with(|| format!("loading {}", cli.config.display()))?;
    let backend_cfg = config.backend(backend)?.clone();
    info!(backend = %backend, "starting gateway");

    let limiter = Arc::new(UpstreamLimiter::new(backend.as_str(), &config.rate_limiter));
    let timeout = config.upstream_timeout();
    let adapter: Arc<dyn ChainAdapter> = match backend {
        Backend::Hardhat | Backend::Ankr => {
            Arc::new(EvmAdapter::new(backend, &backend_cfg, limiter, timeout)?)
        }
        Backend::Tron => Arc::new(TronAdapter::new(&backend_cfg, limiter, timeout)?),
        Backend::Toncenter => Arc::new(TonAdapter::new(&backend_cfg, limiter, timeout)?),
        Backend::Solana => Arc::new(SolanaAdapter::new(&backend_cfg, limiter, timeout)?),
    };

    let table = Arc::new(SubscriptionTable::new(backend.chain()));
    let contracts = Arc::new(ContractInterestSet::new(backend.chain()));
    let cancel = CancellationToken::new();

    let sweeper = tokio::spawn(run_sweeper(table.clone(), cancel.child_token()));

    // Fatal when the initial upstream height cannot be obtained.
    let poller = run_height_poller(adapter.clone(), table.clone(), cancel.child_token())
        .await
        .wrap_err("initial upstream height")?;

    let state = Arc::new(AppState::new(backend, adapter, table, contracts));

    let rpc_cancel = cancel.child_token();
    let rpc_state = state.clone();
    let rpc_port = config.rpc_port;
    let rpc_server = tokio::spawn(async move {
        if let Err(e) = rpc::serve(rpc_state, rpc_port, rpc_cancel).await {
            error!(target: "server::rpc", error = %e, "JSON-RPC server terminated");
        }
    });

    let ws_cancel = cancel.child_token();
    let ws_state = state.clone();
    let ws_port = config.ws_port;
    let ws_server = tokio::spawn(async move {
        if let Err(e) = ws::serve(ws_state, ws_port, ws_cancel).await {
            error!(target: "server::ws", error = %e, "WebSocket server terminated");
        }
    });

    signal::ctrl_c().await.wrap_err("ctrl-c handler")?;
    info!("shutdown signal received");
    cancel.cancel();

    for (name, handle) in [
        ("sweeper", sweeper),
        ("poller", poller),
        ("rpc", rpc_server),
        ("ws", ws_server),
    ] {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            error!(task = name, "task did not stop within grace period");
        }
    }
    info!("gateway stopped");
    Ok(())
}
