use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::proxy::Backend;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const HEALTHY_THRESHOLD: u32 = 2;
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Periodic health prober for a single backend.
///
/// Exactly one worker exists per health-enabled backend per configuration
/// generation, and the worker never outlives its generation.
pub struct HealthWorker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthWorker {
    /// Spawns the probe task parented to `parent`. The first probe runs
    /// immediately; subsequent probes run every `health.interval`.
    pub fn spawn(parent: &CancellationToken, backend: Arc<Backend>, health: HealthConfig) -> Self {
        let token = parent.child_token();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            run(run_token, backend, health).await;
        });

        Self { token, handle }
    }

    /// Cancels the worker and waits for it to exit. Any in-flight probe is
    /// allowed to finish, bounded by the probe timeout.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "health worker exited abnormally");
        }
    }
}

async fn run(token: CancellationToken, backend: Arc<Backend>, health: HealthConfig) {
    let client = match reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .redirect(Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(backend = %backend.url(), error = %err, "failed to build health check client");
            return;
        }
    };

    let probe_url = format!(
        "{}{}",
        backend.url().as_str().trim_end_matches('/'),
        health.path
    );

    let mut ticker = tokio::time::interval(health.interval);
    // the interval's first tick completes immediately
    ticker.tick().await;

    // cancellation is only raced against the tick, never the probe itself
    loop {
        probe(&client, &probe_url, &backend).await;

        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
    }
}

/// Issues one GET against the backend's health endpoint. Any status in
/// [200, 400) counts as a success; everything else, including transport
/// errors and timeouts, counts as a failure.
async fn probe(client: &reqwest::Client, url: &str, backend: &Backend) {
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if (200..400).contains(&status) {
                track_success(backend);
            } else {
                track_failure(backend);
                debug!(backend = %backend.url(), status, "health check detected unhealthy status");
            }
        }
        Err(err) => {
            track_failure(backend);
            debug!(backend = %backend.url(), error = %err, "health check failed");
        }
    }
}

fn track_success(backend: &Backend) {
    let successes = backend.record_success();

    if successes >= HEALTHY_THRESHOLD && !backend.swap_healthy(true) {
        debug!(
            backend = %backend.url(),
            consecutive_successes = successes,
            "backend became healthy"
        );
    }
}

fn track_failure(backend: &Backend) {
    let failures = backend.record_failure();

    if failures >= UNHEALTHY_THRESHOLD && backend.swap_healthy(false) {
        debug!(
            backend = %backend.url(),
            consecutive_failures = failures,
            "backend became unhealthy"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;
    use std::time::Duration;

    fn backend() -> Backend {
        Backend::new(Url::parse("http://127.0.0.1:9001").unwrap()).unwrap()
    }

    #[test]
    fn stays_healthy_until_third_consecutive_failure() {
        let backend = backend();

        track_failure(&backend);
        track_failure(&backend);
        assert!(backend.is_healthy());

        track_failure(&backend);
        assert!(!backend.is_healthy());
    }

    #[test]
    fn recovers_on_second_consecutive_success() {
        let backend = backend();
        for _ in 0..3 {
            track_failure(&backend);
        }
        assert!(!backend.is_healthy());

        track_success(&backend);
        assert!(!backend.is_healthy());

        track_success(&backend);
        assert!(backend.is_healthy());
    }

    #[test]
    fn mixed_results_reset_the_opposing_streak() {
        let backend = backend();

        track_failure(&backend);
        track_failure(&backend);
        track_success(&backend);
        track_failure(&backend);
        track_failure(&backend);
        assert!(backend.is_healthy());

        track_failure(&backend);
        assert!(!backend.is_healthy());
    }

    #[test]
    fn success_keeps_counting_while_healthy() {
        let backend = backend();

        track_success(&backend);
        track_success(&backend);
        track_success(&backend);
        assert!(backend.is_healthy());
        assert_eq!(backend.consec_success(), 3);
    }

    #[test]
    fn proxy_failures_contribute_to_demotion() {
        let backend = backend();

        backend.note_failure();
        backend.note_failure();
        track_failure(&backend);
        assert!(!backend.is_healthy());
    }

    #[tokio::test]
    async fn stop_terminates_the_worker() {
        // unreachable origin, failures come back as fast connection errors
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Arc::new(
            Backend::new(Url::parse(&format!("http://{}", addr)).unwrap()).unwrap(),
        );
        let root = CancellationToken::new();
        let worker = HealthWorker::spawn(
            &root,
            Arc::clone(&backend),
            HealthConfig {
                path: "/health".into(),
                interval: Duration::from_secs(60),
            },
        );

        tokio::time::timeout(Duration::from_secs(5), worker.stop())
            .await
            .expect("worker did not stop in time");
    }

    #[tokio::test]
    async fn probes_count_failures_for_dead_backends() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Arc::new(
            Backend::new(Url::parse(&format!("http://{}", addr)).unwrap()).unwrap(),
        );
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(Policy::none())
            .build()
            .unwrap();
        let url = format!("{}{}", backend.url().as_str().trim_end_matches('/'), "/health");

        for _ in 0..UNHEALTHY_THRESHOLD {
            probe(&client, &url, &backend).await;
        }
        assert!(!backend.is_healthy());
    }
}
