pub mod broker;
pub mod collector;
pub mod config;
pub mod error;
pub mod generator;
pub mod http;
pub mod metrics;
pub mod observability;
pub mod processor;
pub mod store;
pub mod telemetry;
