use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use halb::config::Config;
use halb::proxy::{self, Router};

#[derive(Parser, Debug)]
#[command(name = "halb")]
#[command(about = "HTTP Layer-7 load balancer and reverse proxy")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

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

    info!(config = %args.config, "halb starting");

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    let router = Arc::new(Router::new());
    router
        .reload(&config)
        .await
        .context("failed to initialize routing table")?;

    // SIGHUP re-reads the config file; a failed reload keeps the previous
    // configuration in force
    #[cfg(unix)]
    spawn_reload_task(Arc::clone(&router), args.config.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(port = config.server.port, "server listening");

    proxy::serve(listener, router, config.server.timeout, shutdown_signal()).await?;

    info!("halb shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_task(router: Arc<Router>, config_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                error!(error = %err, "failed to install SIGHUP handler");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("config reload requested, reloading now");

            match Config::load(&config_path).await {
                Ok(new_config) => {
                    if let Err(err) = router.reload(&new_config).await {
                        error!(error = %err, "failed to reload configuration, keeping current configuration");
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to load config, keeping current configuration");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        // without a signal handler, park until the process is killed
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
