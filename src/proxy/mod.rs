pub mod engine;
pub mod load_balancer;
pub mod upstream;

pub use engine::{serve, Router, RoutingTable};
pub use upstream::{Backend, ServerPool};
