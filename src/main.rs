use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_gateway::config::Config;
use api_gateway::gateway::Gateway;
use api_gateway::shutdown::{self, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "A lightweight API gateway")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate the configuration file and exit.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting API gateway");

    let config = Config::load(&args.config).await?;
    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    let addr = config.server.bind_addr()?;
    let grace = config.server.shutdown_grace;
    let gateway = Gateway::new(config)?;

    let shutdown = Shutdown::new();
    gateway.start_background(&shutdown);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("gateway listening on {}", addr);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown::wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.trigger();
    });

    let mut drain = shutdown.subscribe();
    let app = gateway.app();
    let server = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain.changed().await;
        })
        .await
    };

    // Drain in-flight requests, bounded by the configured grace period.
    let mut grace_timer = shutdown.subscribe();
    tokio::select! {
        result = server => {
            result.context("server error")?;
        }
        _ = async {
            let _ = grace_timer.changed().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("shutdown grace period elapsed with requests still in flight");
        }
    }

    info!("gateway stopped");
    Ok(())
}
