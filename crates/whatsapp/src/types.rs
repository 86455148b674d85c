//! Events emitted by the WhatsApp Web transport.
//!
//! Message payloads keep the Baileys field names (`remoteJid`, `fromMe`,
//! `extendedTextMessage`, ...) since the sidecar forwards them verbatim.

use serde::{Deserialize, Deserializer, Serialize};

/// Status code the transport reports when the session must be rebuilt
/// (expected right after first-time enrollment).
pub const STATUS_RESTART_REQUIRED: u16 = 515;
/// Status code the transport reports when the device was logged out.
pub const STATUS_LOGGED_OUT: u16 = 401;

/// One event delivered by the transport. Events arrive in ordered batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    ConnectionUpdate(ConnectionUpdate),
    /// Updated credential state to persist.
    CredentialsUpdate(serde_json::Value),
    HistorySet(HistorySet),
    MessageUpsert(MessageUpsert),
    MessageUpdate(Vec<serde_json::Value>),
    Reaction(Vec<serde_json::Value>),
    Receipt(Vec<serde_json::Value>),
    PresenceUpdate(serde_json::Value),
    ChatUpdate(Vec<serde_json::Value>),
    ContactUpdate(Vec<ContactUpdate>),
    ChatDelete(Vec<String>),
    CallNotice(Vec<serde_json::Value>),
    LabelEvent(serde_json::Value),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionUpdate(_) => "connection_update",
            Self::CredentialsUpdate(_) => "credentials_update",
            Self::HistorySet(_) => "history_set",
            Self::MessageUpsert(_) => "message_upsert",
            Self::MessageUpdate(_) => "message_update",
            Self::Reaction(_) => "reaction",
            Self::Receipt(_) => "receipt",
            Self::PresenceUpdate(_) => "presence_update",
            Self::ChatUpdate(_) => "chat_update",
            Self::ContactUpdate(_) => "contact_update",
            Self::ChatDelete(_) => "chat_delete",
            Self::CallNotice(_) => "call_notice",
            Self::LabelEvent(_) => "label_event",
        }
    }
}

/// Phase reported in a connection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionPhase>,
    #[serde(default)]
    pub last_disconnect: Option<LastDisconnect>,
    /// Credential bootstrap token to render as a QR code.
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub is_new_login: Option<bool>,
    #[serde(default)]
    pub received_pending_notifications: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDisconnect {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Why a session closed, derived from the transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RestartRequired,
    LoggedOut,
    Other(Option<u16>),
}

impl DisconnectReason {
    pub fn from_status(status_code: Option<u16>) -> Self {
        match status_code {
            Some(STATUS_RESTART_REQUIRED) => Self::RestartRequired,
            Some(STATUS_LOGGED_OUT) => Self::LoggedOut,
            other => Self::Other(other),
        }
    }

    pub fn should_restart(&self) -> bool {
        !matches!(self, Self::LoggedOut)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartRequired => f.write_str("restart required"),
            Self::LoggedOut => f.write_str("logged out"),
            Self::Other(Some(code)) => write!(f, "disconnected ({code})"),
            Self::Other(None) => f.write_str("disconnected (no status)"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySet {
    #[serde(default)]
    pub chats: Vec<serde_json::Value>,
    #[serde(default)]
    pub contacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub is_latest: Option<bool>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub sync_type: Option<serde_json::Value>,
}

/// Delivery intent of an upsert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertType {
    /// New messages received live.
    Notify,
    /// Messages appended from history or other devices.
    Append,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpsert {
    #[serde(rename = "type")]
    pub kind: UpsertType,
    #[serde(default)]
    pub messages: Vec<WebMessage>,
    /// Set when the batch answers a placeholder resend request.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: Option<bool>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub push_name: Option<String>,
}

impl WebMessage {
    /// Plain or extended text body, if the message carries non-empty text.
    pub fn text(&self) -> Option<&str> {
        let content = self.message.as_ref()?;
        content
            .conversation
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| {
                content
                    .extended_text_message
                    .as_ref()
                    .and_then(|ext| ext.text.as_deref())
                    .filter(|t| !t.is_empty())
            })
    }

    pub fn is_from_me(&self) -> bool {
        self.key.from_me.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedTextMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedTextMessage {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    pub id: String,
    /// Absent: unchanged. `null`: picture removed. String: picture changed.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub img_url: Option<Option<String>>,
}

/// Map a present field (including `null`) to `Some`, leaving absence to `default`.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Baileys sends timestamps as numbers, numeric strings, or `{low, high}` longs.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
        Long { low: i64, high: i64 },
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Int(v)) => Some(v),
        Some(Raw::Float(v)) => Some(v as i64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        Some(Raw::Long { low, high }) => Some((high << 32) | (low & 0xffff_ffff)),
    })
}
