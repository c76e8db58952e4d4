pub mod circuit_breaker;
pub mod dispatcher;
pub mod intent;
pub mod memory;
pub mod metrics;
pub mod protocol;
pub mod safety;
