// Public API - wire protocol, server, and metrics
pub mod config;
pub mod metrics;
pub mod proto;
pub mod server;
pub mod transport;

// Startup surface used by the binary
pub mod cli;
