use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use super::load_balancer;
use super::upstream::{Backend, ServerPool};
use crate::config::Config;
use crate::error::ProxyError;
use crate::health::HealthWorker;
use crate::net;

/// Immutable snapshot mapping normalized host to its server pool.
///
/// Replaced wholesale by `Router::reload`; never mutated after publication.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<ServerPool>>,
}

impl RoutingTable {
    /// Exact match on a lowercased, portless host.
    pub fn lookup(&self, host: &str) -> Option<&Arc<ServerPool>> {
        self.routes.get(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The proxy core: a lock-free routing table for the request path and a
/// control plane that rebuilds it on reload.
pub struct Router {
    table: ArcSwap<RoutingTable>,
    /// Control-plane lock guarding the health worker set. The request path
    /// never takes it.
    control: Mutex<Vec<HealthWorker>>,
    /// Root cancellation scope for worker parentage.
    root: CancellationToken,
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RoutingTable::default()),
            control: Mutex::new(Vec::new()),
            root: CancellationToken::new(),
        }
    }

    /// Current routing table. Requests that hold a snapshot keep routing
    /// against it even if a reload publishes a replacement.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Atomically swaps in the routing state for `config`.
    ///
    /// All construction that can fail happens before any existing worker is
    /// stopped, so a failed reload leaves the previous generation serving
    /// and fully monitored. Concurrent requests observe either the old or
    /// the new table, never a mix.
    pub async fn reload(&self, config: &Config) -> Result<()> {
        let mut current_workers = self.control.lock().await;

        debug!(services = config.services.len(), "reloading configuration");

        let mut routes = HashMap::new();
        let mut staged = Vec::new();

        for (name, service) in &config.services {
            let mut backends = Vec::with_capacity(service.servers.len());

            for server in &service.servers {
                let url = Url::parse(server).with_context(|| {
                    format!("service {:?}: invalid server url {:?}", name, server)
                })?;
                let backend = Arc::new(Backend::new(url)?);

                if service.health.enabled() {
                    staged.push((Arc::clone(&backend), service.health.clone()));
                }
                backends.push(backend);
            }

            let host = net::normalize_host(&service.host);
            let pool = Arc::new(ServerPool::new(
                backends,
                service.strategy,
                service.health.clone(),
            ));

            info!(
                service = %name,
                host = %host,
                strategy = ?service.strategy,
                backends = pool.backends().len(),
                "service configured"
            );
            routes.insert(host, pool);
        }

        let table = Arc::new(RoutingTable { routes });

        // Old probers stop before their replacements start. Each stop is
        // bounded by the probe timeout.
        for worker in current_workers.drain(..) {
            worker.stop().await;
        }

        *current_workers = staged
            .into_iter()
            .map(|(backend, health)| HealthWorker::spawn(&self.root, backend, health))
            .collect();

        self.table.store(table);

        info!(services = self.table.load().len(), "configuration reload complete");
        Ok(())
    }

    /// Stops every health worker and waits for completion. In-flight
    /// requests are left to the HTTP server's graceful shutdown.
    pub async fn shutdown(&self) {
        let mut workers = self.control.lock().await;
        info!(count = workers.len(), "shutting down health checkers");

        self.root.cancel();
        for worker in workers.drain(..) {
            worker.stop().await;
        }
    }

    async fn route(&self, peer: SocketAddr, req: Request) -> Response {
        let start = Instant::now();
        let table = self.table.load();

        let Some(raw_host) = inbound_host(&req) else {
            return ProxyError::MissingHost.into_response();
        };
        let host = net::normalize_host(&raw_host);

        let Some(pool) = table.lookup(&host) else {
            warn!(host = %host, original_host = %raw_host, peer = %peer, "no route found");
            return ProxyError::RouteNotFound(host).into_response();
        };

        let Some(backend) = load_balancer::select(pool) else {
            error!(
                host = %host,
                total_backends = pool.backends().len(),
                "no healthy backend servers available"
            );
            return ProxyError::NoHealthyBackend(host).into_response();
        };

        let client_ip = net::client_ip(peer.ip(), req.headers());
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "failed to read request body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        match forward(&backend, &raw_host, &client_ip, parts, body).await {
            Ok(response) => {
                log_request(&client_ip, &host, &method, &path, &backend, response.status(), start);
                response
            }
            Err(err) => {
                let failures = backend.note_failure();
                error!(
                    backend = %backend.url(),
                    path = %path,
                    consecutive_failures = failures,
                    error = %err,
                    "proxy error"
                );
                let response = ProxyError::Upstream(err.to_string()).into_response();
                log_request(&client_ip, &host, &method, &path, &backend, response.status(), start);
                response
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards one request to `backend` and streams the response back.
///
/// The outgoing request carries the backend's scheme and host, the inbound
/// path and query, and the forwarding headers. The connection guard rides
/// the response body so `active_conns` drops only once the body has fully
/// drained, on every exit path.
async fn forward(
    backend: &Arc<Backend>,
    inbound_host: &str,
    client_ip: &str,
    parts: axum::http::request::Parts,
    body: Bytes,
) -> Result<Response, reqwest::Error> {
    let guard = ConnGuard::new(Arc::clone(backend));

    let mut target = backend.url().clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());

    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 3);
    for (name, value) in parts.headers.iter() {
        // the Host header follows the target URL and the content length is
        // reframed from the forwarded body
        if *name == header::HOST || *name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(backend.url().scheme()) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
    }
    if let Ok(value) = HeaderValue::from_str(inbound_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }

    let mut request = backend
        .client()
        .request(parts.method, target)
        .headers(headers);

    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request.send().await?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers().iter() {
        if !is_hop_by_hop(name) {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let body_stream = upstream.bytes_stream().map(move |chunk| {
        let _guard = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Runs the HTTP server on `listener` until `shutdown` resolves, then stops
/// the router's health workers.
pub async fn serve<F>(
    listener: TcpListener,
    router: Arc<Router>,
    timeout: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new()
        .fallback(handle)
        .layer(TimeoutLayer::new(timeout))
        .with_state(Arc::clone(&router));

    let addr = listener.local_addr().context("listener has no local address")?;
    info!(addr = %addr, "reverse proxy listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    router.shutdown().await;
    Ok(())
}

async fn handle(
    State(router): State<Arc<Router>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    router.route(peer, req).await
}

/// Scoped `active_conns` accounting for one proxied request.
struct ConnGuard {
    backend: Arc<Backend>,
}

impl ConnGuard {
    fn new(backend: Arc<Backend>) -> Self {
        backend.inc_active();
        Self { backend }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.backend.dec_active();
    }
}

fn inbound_host(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(header::HOST) {
        return value.to_str().ok().map(str::to_owned);
    }
    req.uri()
        .authority()
        .map(|authority| authority.as_str().to_owned())
}

fn log_request(
    ip: &str,
    host: &str,
    method: &Method,
    path: &str,
    backend: &Backend,
    status: StatusCode,
    start: Instant,
) {
    info!(
        ip = %ip,
        host = %host,
        method = %method,
        path = %path,
        backend = %backend.url(),
        status = status.as_u16(),
        latency = start.elapsed().as_millis() as u64,
        "request"
    );
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
