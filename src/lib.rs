//! HALB is an HTTP reverse proxy and Layer-7 load balancer.
//!
//! Inbound requests are routed by virtual hostname through a lock-free
//! routing table to a pool of upstream backends; a selection strategy picks
//! a healthy backend and the response is streamed back. Per-backend health
//! workers probe upstreams with hysteresis, and the whole routing state can
//! be hot reloaded without dropping in-flight work.

pub mod config;
pub mod error;
pub mod health;
pub mod net;
pub mod proxy;

pub use config::Config;
pub use proxy::Router;
