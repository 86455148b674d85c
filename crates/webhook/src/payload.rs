use serde::{Deserialize, Serialize};

/// Body posted to a channel webhook for every extracted link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRelayPayload {
    pub link: String,
    /// Sender identifier, or a label for the session's own account.
    pub sender: String,
    #[serde(rename = "groupName")]
    pub channel_name: String,
    /// Message time in epoch seconds.
    pub timestamp: i64,
    pub original_message: String,
    #[serde(rename = "isOwnMessage")]
    pub is_self_originated: bool,
}
