pub mod agent;
pub mod batcher;
pub mod circuit_breaker;
pub mod connection;
pub mod shipper;

pub use agent::EdgeAgent;
pub use batcher::{BatchPayload, TopicBatcher};
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use connection::{ConnectionProvider, TcpPool};
pub use shipper::{Shipper, ShipperConfig};
