//! Shared harness for the end-to-end proxy tests: stub upstream origins on
//! ephemeral ports, config values built in code, and a proxy server spawned
//! around a `Router` that tests drive directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use serde_json::json;
use tokio::net::TcpListener;

use halb::config::{Config, HealthConfig, ServerConfig, ServiceConfig, Strategy};
use halb::proxy::{self, Router};

/// Spawns a stub upstream that answers probes on `/health` and echoes the
/// forwarding headers back on every other path.
pub async fn spawn_upstream(label: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = axum::Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "healthy" })) }),
        )
        .fallback(move |req: Request| async move { echo(label, req) });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn echo(label: &'static str, req: Request) -> Response {
    let mut builder = Response::builder()
        .status(200)
        .header("echo-server", label);

    for name in [
        "host",
        "x-forwarded-for",
        "x-forwarded-proto",
        "x-forwarded-host",
    ] {
        if let Some(value) = req.headers().get(name) {
            builder = builder.header(format!("echo-{}", name), value.clone());
        }
    }

    builder.body(Body::from(label)).unwrap()
}

/// An address nothing listens on, for connection-refused backends.
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn service(
    host: &str,
    servers: &[SocketAddr],
    strategy: Strategy,
    health: Option<HealthConfig>,
) -> ServiceConfig {
    ServiceConfig {
        host: host.to_string(),
        strategy,
        servers: servers
            .iter()
            .map(|addr| format!("http://{}", addr))
            .collect(),
        health: health.unwrap_or_default(),
    }
}

pub fn config(services: Vec<(&str, ServiceConfig)>) -> Config {
    Config {
        server: ServerConfig::default(),
        services: services
            .into_iter()
            .map(|(name, service)| (name.to_string(), service))
            .collect(),
    }
}

pub fn health(path: &str, interval: Duration) -> HealthConfig {
    HealthConfig {
        path: path.to_string(),
        interval,
    }
}

/// Serves the router on an ephemeral port and returns its address.
pub async fn spawn_proxy(router: Arc<Router>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        proxy::serve(
            listener,
            router,
            Duration::from_secs(30),
            std::future::pending::<()>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// Client whose virtual hosts resolve to the proxy address, so requests
/// carry a real `Host: <vhost>:<port>` header.
pub fn client(hosts: &[&str], proxy: SocketAddr) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    for host in hosts {
        builder = builder.resolve(host, proxy);
    }
    builder.build().unwrap()
}

pub fn url(host: &str, proxy: SocketAddr, path: &str) -> String {
    format!("http://{}:{}{}", host, proxy.port(), path)
}
