//! Config schema types (server, channels, whatsapp session, webhook delivery).

use std::path::PathBuf;

use {
    serde::{Deserialize, Serialize},
    url::Url,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub channels: ChannelsConfig,
    pub whatsapp: WhatsAppConfig,
    pub webhook: WebhookConfig,
}

/// Liveness endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "0.0.0.0" so container health checks reach it.
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// One monitored conversation and the webhook its links are relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Opaque channel key, e.g. `120363000000000000@g.us`.
    #[serde(alias = "jid")]
    pub identifier: String,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(alias = "webhook")]
    pub webhook_url: Url,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "description", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Where the monitored channel list comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Channel list file (JSON, TOML or YAML).
    pub file: PathBuf,
    /// Channels used when `file` cannot be read or parsed.
    pub fallback: Vec<ChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("channels.json"),
            fallback: Vec::new(),
        }
    }
}

/// How a fresh session enrolls its credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Surface a QR token to be scanned from the phone.
    #[default]
    Qr,
    /// Request a numeric pairing code bound to `phone_number`.
    PairingCode,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "qr" => Ok(Self::Qr),
            "pairing_code" | "pairing" => Ok(Self::PairingCode),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

/// WhatsApp Web session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub auth_mode: AuthMode,
    /// Phone number in E.164 format without `+`, required for pairing-code auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Directory holding persisted credentials. Defaults to `<data dir>/auth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,
    /// Ask the sidecar to sync the full chat history on login.
    pub sync_full_history: bool,
    /// Delay before retrying when a session cannot be constructed at all.
    pub reconnect_delay_ms: u64,
    pub sidecar: SidecarSettings,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Qr,
            phone_number: None,
            auth_dir: None,
            sync_full_history: true,
            reconnect_delay_ms: 1_000,
            sidecar: SidecarSettings::default(),
        }
    }
}

/// Baileys sidecar process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSettings {
    /// WebSocket port the sidecar listens on.
    pub port: u16,
    /// Spawn and supervise the sidecar process from this binary.
    pub auto_start: bool,
    /// Directory containing the sidecar `package.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            port: 3180,
            auto_start: true,
            dir: None,
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Upper bound for one delivery attempt, connect included.
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: None,
        }
    }
}

fn default_true() -> bool {
    true
}
