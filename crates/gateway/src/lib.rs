//! Gateway: HTTP liveness endpoint for container and orchestrator health checks.
//!
//! The server is started before the WhatsApp session connects and reports
//! the current connection state without ever blocking on it.

pub mod server;
pub mod state;

pub use {
    server::{HealthReport, build_health_app, serve_health, start_health_server},
    state::GatewayState,
};
