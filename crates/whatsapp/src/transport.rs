//! Boundary between the session controller and the WhatsApp Web transport.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::types::InboundEvent;

/// Ordered batch of events as emitted by the transport.
pub type EventBatch = Vec<InboundEvent>;

/// Failure reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}{}", .status_code.map(|c| format!(" (status {c})")).unwrap_or_default())]
#[serde(rename_all = "camelCase")]
pub struct TransportError {
    #[serde(default)]
    pub status_code: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
        }
    }

    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            message: message.into(),
        }
    }
}

/// Web client version advertised to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersion {
    pub version: Vec<u32>,
    #[serde(default)]
    pub is_latest: bool,
}

impl ProtocolVersion {
    pub fn dotted(&self) -> String {
        self.version
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Options for starting one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    /// Persisted credentials; `None` starts a fresh enrollment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creds: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Vec<u32>>,
    pub sync_full_history: bool,
}

/// Group metadata as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<serde_json::Value>,
    /// Creation time in epoch seconds.
    #[serde(default)]
    pub creation: Option<i64>,
}

/// Operations a live session exposes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin login with the given options. Events start flowing afterwards.
    async fn start(&self, options: SessionOptions) -> Result<(), TransportError>;

    async fn fetch_latest_version(&self) -> Result<ProtocolVersion, TransportError>;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError>;

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, TransportError>;

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, TransportError>;

    /// Send a plain text message, returning the message id.
    async fn send_message(&self, jid: &str, text: &str) -> Result<String, TransportError>;

    /// Whether the loaded credentials already belong to an enrolled device.
    fn is_registered(&self) -> bool;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// A freshly constructed session: the handle plus its consumed-once event stream.
pub struct Session {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<EventBatch>,
}

/// Builds new sessions. Called once per (re)connect.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Session, TransportError>;
}
