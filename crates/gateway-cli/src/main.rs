//! `mcp-gateway` binary entry point: loads configuration, wires the
//! application context, and serves the axum router with a graceful
//! shutdown sequence (§5).

mod config;
mod context;
mod factory;
mod shutdown;

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", about = "Multi-tenant MCP gateway")]
struct Cli {
    /// Overrides `BACKEND_PORT` from configuration.
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_pretty {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GatewayConfig::load()?;
    if let Some(port) = cli.port {
        config.backend_port = port;
    }

    init_tracing(&config);
    tracing::info!(
        base_url = %config.base_url,
        port = config.backend_port,
        "starting mcp-gateway"
    );

    let app_context = context::build(&config).await?;
    let router = gateway_web::build_router(app_context.state.clone());

    let addr: SocketAddr = config.bind_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::wait_for_signal())
        .await?;

    shutdown::run(app_context).await;
    Ok(())
}
