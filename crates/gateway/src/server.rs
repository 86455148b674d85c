use std::net::SocketAddr;

use {
    axum::{Json, Router, extract::State, response::IntoResponse, routing::get},
    linkrelay_common::{ConnectionState, Result},
    serde::{Deserialize, Serialize},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::state::GatewayState;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    /// RFC 3339 time of the response.
    pub timestamp: String,
    pub connection_state: ConnectionState,
    pub monitored_channel_count: usize,
}

/// Routes: `/health` and `/`. Anything else is a 404.
pub fn build_health_app(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(health_handler))
        .with_state(state)
}

/// Bind `bind:port` and serve until `shutdown` fires.
pub async fn start_health_server(
    bind: &str,
    port: u16,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    serve_health(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve_health(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, build_health_app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("health endpoint stopped");
    Ok(())
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok".into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        connection_state: state.connection_state(),
        monitored_channel_count: state.monitored_channels(),
    })
}

#[cfg(test)]
mod tests {
    use {super::*, linkrelay_common::status_channel};

    #[tokio::test]
    async fn handler_reports_current_state() {
        let (publisher, handle) = status_channel();
        let state = GatewayState::new(handle, 3);

        publisher.set(ConnectionState::Open);
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn report_wire_format() {
        let report = HealthReport {
            status: "ok".into(),
            timestamp: "2024-01-01T00:00:00+00:00".into(),
            connection_state: ConnectionState::AwaitingCredentials,
            monitored_channel_count: 2,
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "status": "ok",
                "timestamp": "2024-01-01T00:00:00+00:00",
                "connectionState": "awaiting_credentials",
                "monitoredChannelCount": 2,
            })
        );
    }
}
