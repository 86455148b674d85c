//! Per-event dispatch: credential persistence, link relay, and logging.

use std::sync::Arc;

use {
    linkrelay_channels::{ChannelKind, ChannelRegistry, extract_links},
    linkrelay_webhook::{LinkDispatcher, LinkRelayPayload},
    tokio::sync::mpsc,
    tracing::{debug, error, info, trace, warn},
};

use crate::{
    creds::CredentialStore,
    transport::Transport,
    types::{
        ConnectionUpdate, ContactUpdate, HistorySet, InboundEvent, MessageUpsert, UpsertType,
        WebMessage,
    },
};

/// Sender label used for messages the session's own account wrote.
pub const OWN_ACCOUNT_SENDER: &str = "own account";
const UNKNOWN_SENDER: &str = "unknown";

/// Routes transport events for one session.
///
/// Connection updates are handed back to the lifecycle controller through
/// `connection_tx`; everything else is handled here.
pub struct EventRouter {
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<dyn LinkDispatcher>,
    creds: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    connection_tx: mpsc::UnboundedSender<ConnectionUpdate>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        dispatcher: Arc<dyn LinkDispatcher>,
        creds: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        connection_tx: mpsc::UnboundedSender<ConnectionUpdate>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            creds,
            transport,
            connection_tx,
        }
    }

    pub async fn route(&self, event: InboundEvent) {
        trace!(kind = event.kind(), "routing event");
        match event {
            InboundEvent::ConnectionUpdate(update) => {
                if self.connection_tx.send(update).is_err() {
                    debug!("connection update dropped, controller gone");
                }
            },
            InboundEvent::CredentialsUpdate(creds) => {
                if let Err(e) = self.creds.persist(&creds).await {
                    error!(error = %e, "failed to persist credentials");
                }
            },
            InboundEvent::MessageUpsert(upsert) => self.on_upsert(upsert).await,
            InboundEvent::HistorySet(history) => log_history(&history),
            InboundEvent::ContactUpdate(contacts) => self.on_contacts(contacts).await,
            InboundEvent::MessageUpdate(updates) => {
                debug!(count = updates.len(), "message updates");
            },
            InboundEvent::Reaction(reactions) => debug!(count = reactions.len(), "reactions"),
            InboundEvent::Receipt(receipts) => trace!(count = receipts.len(), "receipts"),
            InboundEvent::PresenceUpdate(presence) => trace!(?presence, "presence update"),
            InboundEvent::ChatUpdate(chats) => debug!(count = chats.len(), "chat updates"),
            InboundEvent::ChatDelete(ids) => debug!(?ids, "chats deleted"),
            InboundEvent::CallNotice(calls) => debug!(count = calls.len(), "call notices"),
            InboundEvent::LabelEvent(label) => debug!(?label, "label event"),
        }
    }

    async fn on_upsert(&self, upsert: MessageUpsert) {
        if let Some(request_id) = upsert.request_id.as_deref() {
            info!(request_id, count = upsert.messages.len(), "placeholder resend answered");
        }
        if upsert.kind != UpsertType::Notify {
            debug!(kind = ?upsert.kind, count = upsert.messages.len(), "skipping non-live upsert");
            return;
        }
        for message in &upsert.messages {
            self.relay_message(message).await;
        }
    }

    /// Relay every link in `message` to its channel's webhook.
    ///
    /// Returns the number of deliveries attempted.
    pub async fn relay_message(&self, message: &WebMessage) -> usize {
        let Some(text) = message.text() else {
            trace!(id = ?message.key.id, "message without text");
            return 0;
        };
        let Some(remote) = message.key.remote_jid.as_deref() else {
            debug!(id = ?message.key.id, "message without chat identifier");
            return 0;
        };
        let kind = ChannelKind::of(remote);
        let Some(channel) = self.registry.lookup(remote) else {
            debug!(chat = remote, kind = kind.as_str(), "message from unmonitored chat");
            return 0;
        };

        let links = extract_links(text);
        if links.is_empty() {
            trace!(channel = %channel.display_name, "no links in message");
            return 0;
        }

        let sender = sender_label(message);
        let timestamp = message
            .message_timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        info!(
            channel = %channel.display_name,
            kind = kind.as_str(),
            sender,
            links = links.len(),
            "relaying links"
        );

        let mut attempted = 0;
        for link in links {
            let payload = LinkRelayPayload {
                link,
                sender: sender.to_string(),
                channel_name: channel.display_name.clone(),
                timestamp,
                original_message: text.to_string(),
                is_self_originated: message.is_from_me(),
            };
            let outcome = self.dispatcher.deliver(&channel.webhook_url, &payload).await;
            debug!(link = %payload.link, %outcome, "link dispatched");
            attempted += 1;
        }
        attempted
    }

    async fn on_contacts(&self, contacts: Vec<ContactUpdate>) {
        for contact in contacts {
            match contact.img_url {
                Some(Some(_)) => match self.transport.profile_picture_url(&contact.id).await {
                    Ok(url) => info!(contact = %contact.id, url = ?url, "profile picture changed"),
                    Err(e) => {
                        warn!(contact = %contact.id, error = %e, "profile picture lookup failed");
                    },
                },
                Some(None) => info!(contact = %contact.id, "profile picture removed"),
                None => trace!(contact = %contact.id, "contact updated"),
            }
        }
    }
}

fn sender_label(message: &WebMessage) -> &str {
    if message.is_from_me() {
        return OWN_ACCOUNT_SENDER;
    }
    message
        .key
        .participant
        .as_deref()
        .or(message.key.remote_jid.as_deref())
        .unwrap_or(UNKNOWN_SENDER)
}

fn log_history(history: &HistorySet) {
    info!(
        chats = history.chats.len(),
        contacts = history.contacts.len(),
        messages = history.messages.len(),
        is_latest = ?history.is_latest,
        progress = ?history.progress,
        sync_type = ?history.sync_type,
        "history sync received"
    );
}
