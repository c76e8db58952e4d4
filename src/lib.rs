//! sagebot core — request routing and fault tolerance for the research assistant.

pub mod agent;
pub mod cache;
pub mod config;
pub mod errors;
pub mod providers;
pub mod store;
pub mod utils;
