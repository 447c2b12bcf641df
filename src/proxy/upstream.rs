use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::redirect::Policy;
use reqwest::Url;

use crate::config::{HealthConfig, Strategy};

const POOL_MAX_IDLE_PER_HOST: usize = 20;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One upstream origin server.
///
/// Shared between its pool, its health worker and any in-flight request for
/// the lifetime of one configuration generation. Only the atomic fields
/// mutate after construction.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    client: reqwest::Client,
    is_healthy: AtomicBool,
    weight: u32,
    active_conns: AtomicI64,
    consec_success: AtomicU32,
    consec_failure: AtomicU32,
}

impl Backend {
    /// Creates a backend with a preconfigured proxy client for its origin.
    /// Redirects are surfaced verbatim and bodies are never decompressed.
    pub fn new(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(Policy::none())
            .build()
            .with_context(|| format!("failed to build proxy client for {}", url))?;

        Ok(Self {
            url,
            client,
            is_healthy: AtomicBool::new(true),
            weight: 1,
            active_conns: AtomicI64::new(0),
            consec_success: AtomicU32::new(0),
            consec_failure: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Reserved for weighted selection, always 1.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    /// Stores the liveness flag, returning the previous value.
    pub fn swap_healthy(&self, healthy: bool) -> bool {
        self.is_healthy.swap(healthy, Ordering::Relaxed)
    }

    pub fn inc_active(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_conns(&self) -> i64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    /// Counts a forwarded-request transport failure. Liveness is left to the
    /// health worker; the next probe folds this into its hysteresis.
    pub fn note_failure(&self) -> u32 {
        self.consec_failure.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Counts a probe success and resets the failure streak.
    pub fn record_success(&self) -> u32 {
        let successes = self.consec_success.fetch_add(1, Ordering::Relaxed) + 1;
        self.consec_failure.store(0, Ordering::Relaxed);
        successes
    }

    /// Counts a probe failure and resets the success streak.
    pub fn record_failure(&self) -> u32 {
        let failures = self.consec_failure.fetch_add(1, Ordering::Relaxed) + 1;
        self.consec_success.store(0, Ordering::Relaxed);
        failures
    }

    pub fn consec_success(&self) -> u32 {
        self.consec_success.load(Ordering::Relaxed)
    }

    pub fn consec_failure(&self) -> u32 {
        self.consec_failure.load(Ordering::Relaxed)
    }
}

/// Runtime state for one virtual service: its ordered backends plus the
/// selection strategy and health policy. The backend sequence never changes
/// during the pool's lifetime.
#[derive(Debug)]
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    strategy: Strategy,
    rr_cursor: AtomicUsize,
    health: HealthConfig,
}

impl ServerPool {
    pub fn new(backends: Vec<Arc<Backend>>, strategy: Strategy, health: HealthConfig) -> Self {
        Self {
            backends,
            strategy,
            rr_cursor: AtomicUsize::new(0),
            health,
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn health(&self) -> &HealthConfig {
        &self.health
    }

    /// Monotonic round robin cursor, used only by that strategy.
    pub fn next_rr_index(&self) -> usize {
        self.rr_cursor.fetch_add(1, Ordering::Relaxed)
    }
}
