//! Client-side TLS stream proxy
//!
//! # Architecture Overview
//!
//! ```text
//!     application stream              network stream
//!     ──────────────────▶ ┌─────────────────────────┐ ──────────────────▶
//!       plaintext         │  admission (routing)    │   TLS records
//!                         │  accept: wrap           │
//!                         │  handshake correlation  │
//!     ◀────────────────── │  connect-reply: unwrap  │ ◀──────────────────
//!     application reply   └─────────────────────────┘   network reply
//!
//!     memory:        shared region arena, payload budget
//!     tls:           engine adapter (rustls)
//!     observability: tracing + metrics
//! ```
//!
//! The binary loads and validates configuration, installs logging and
//! metrics, and assembles a `ClientStreamFactory`. Frame transport belongs to
//! the embedding runtime.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tls_client_proxy::client::ClientStreamFactory;
use tls_client_proxy::config::{load_config, ProxyConfig};
use tls_client_proxy::memory::HeapArena;
use tls_client_proxy::observability::{logging, metrics};
use tls_client_proxy::routing::StaticRouteTable;
use tls_client_proxy::tls::RustlsEngineFactory;

#[derive(Parser, Debug)]
#[command(name = "tls-client-proxy")]
#[command(about = "Client-side TLS stream proxy", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Err(err) = logging::init_logging(&config.observability) {
        eprintln!("failed to initialise logging: {err}");
    }
    metrics::init_metrics(config.observability.metrics_enabled);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        transfer_capacity = config.tls.transfer_capacity,
        arena_capacity = config.tls.arena_capacity,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if cli.check {
        tracing::info!("Configuration valid");
        return Ok(());
    }

    let routes = StaticRouteTable::from_config(config.routes.clone());
    let engines = RustlsEngineFactory::from_config(&config.tls)?;
    let memory = HeapArena::new(config.tls.arena_capacity);

    let factory = ClientStreamFactory::new(
        Arc::new(routes),
        Arc::new(engines),
        Arc::new(memory),
        config.tls.transfer_capacity,
    );

    tracing::info!(
        factory = ?factory,
        routes = config.routes.len(),
        "Client stream factory ready"
    );
    Ok(())
}
