//! Session status shared between the lifecycle controller and its readers.

use std::fmt;

use {
    serde::{Deserialize, Serialize},
    tokio::sync::watch,
    tracing::debug,
};

/// Connection state of the active messaging session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    /// Waiting for the operator to scan a QR code or enter a pairing code.
    AwaitingCredentials,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingCredentials => "awaiting_credentials",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create the status pair for one process.
///
/// The publisher is owned by the lifecycle controller; handles are cloned
/// freely into readers such as the health endpoint.
pub fn status_channel() -> (StatusPublisher, StatusHandle) {
    let (tx, rx) = watch::channel(ConnectionState::default());
    (StatusPublisher { tx }, StatusHandle { rx })
}

/// Single writer of the connection state.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<ConnectionState>,
}

impl StatusPublisher {
    pub fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }
}

/// Read-only view of the connection state.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<ConnectionState>,
}

impl StatusHandle {
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Wait for the next state change. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
