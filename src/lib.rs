pub mod config;
pub mod mqtt;
pub mod registry;
pub mod telemetry;
