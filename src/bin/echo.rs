//! Demo upstream origin for exercising the load balancer by hand.
//!
//! Serves `/health` for probes and answers every other request with a JSON
//! body identifying the instance, so round robin and failover are visible
//! from the command line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "halb-echo")]
#[command(about = "Demo upstream origin server")]
struct Args {
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Server name reported in responses, defaults to the bind address
    #[arg(short, long)]
    name: Option<String>,

    /// Artificial response delay in milliseconds
    #[arg(short, long, default_value_t = 0)]
    delay_ms: u64,
}

struct EchoState {
    name: String,
    port: u16,
    delay: Duration,
    requests: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().init();

    let name = args
        .name
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));

    let state = Arc::new(EchoState {
        name,
        port: args.port,
        delay: Duration::from_millis(args.delay_ms),
        requests: AtomicU64::new(0),
    });

    let app = axum::Router::new()
        .route("/health", get(health))
        .fallback(echo)
        .with_state(Arc::clone(&state));

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(addr = %addr, name = %state.name, "echo server listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn echo(State(state): State<Arc<EchoState>>) -> impl IntoResponse {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let count = state.requests.fetch_add(1, Ordering::Relaxed) + 1;

    Json(json!({
        "server": state.name,
        "port": state.port,
        "requests": count,
    }))
}
