//! In-memory doubles for router and lifecycle tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    linkrelay_common::{ConnectionState, StatusHandle},
    linkrelay_config::ChannelConfig,
    linkrelay_webhook::{DeliveryOutcome, LinkDispatcher, LinkRelayPayload},
    tokio::sync::mpsc,
    url::Url,
};

use crate::{
    creds::CredentialStore,
    error::{Error, Result},
    transport::{
        EventBatch, GroupMetadata, ProtocolVersion, Session, SessionOptions, Transport,
        TransportConnector, TransportError,
    },
    types::{ConnectionPhase, ConnectionUpdate, InboundEvent, LastDisconnect},
};

pub fn channel(identifier: &str, name: &str, webhook: &str) -> ChannelConfig {
    ChannelConfig {
        identifier: identifier.into(),
        display_name: name.into(),
        webhook_url: Url::parse(webhook).unwrap(),
        enabled: true,
        note: None,
    }
}

pub fn close_event(status: u16) -> InboundEvent {
    InboundEvent::ConnectionUpdate(ConnectionUpdate {
        connection: Some(ConnectionPhase::Close),
        last_disconnect: Some(LastDisconnect {
            status_code: Some(status),
            message: None,
        }),
        ..ConnectionUpdate::default()
    })
}

pub fn open_event() -> InboundEvent {
    InboundEvent::ConnectionUpdate(ConnectionUpdate {
        connection: Some(ConnectionPhase::Open),
        ..ConnectionUpdate::default()
    })
}

pub fn qr_event() -> InboundEvent {
    InboundEvent::ConnectionUpdate(ConnectionUpdate {
        qr: Some("2@bootstrap-token".into()),
        ..ConnectionUpdate::default()
    })
}

/// Connection states sampled at the points where doubles are called,
/// with consecutive repeats folded.
pub struct StatusLog {
    handle: StatusHandle,
    seen: Mutex<Vec<ConnectionState>>,
}

impl StatusLog {
    pub fn new(handle: StatusHandle) -> Self {
        Self {
            handle,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self) {
        let state = self.handle.current();
        let mut seen = self.seen.lock().unwrap();
        if seen.last() != Some(&state) {
            seen.push(state);
        }
    }

    pub fn seen(&self) -> Vec<ConnectionState> {
        self.seen.lock().unwrap().clone()
    }
}

/// Records every call; answers from canned data.
#[derive(Default)]
pub struct MockTransport {
    pub registered: bool,
    pub groups: HashMap<String, GroupMetadata>,
    pub calls: Mutex<Vec<String>>,
    pub started_with: Mutex<Option<SessionOptions>>,
    pub closed: AtomicBool,
    pub status_log: Option<Arc<StatusLog>>,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        if let Some(log) = &self.status_log {
            log.record();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, options: SessionOptions) -> std::result::Result<(), TransportError> {
        self.record("start".into());
        *self.started_with.lock().unwrap() = Some(options);
        Ok(())
    }

    async fn fetch_latest_version(&self) -> std::result::Result<ProtocolVersion, TransportError> {
        Ok(ProtocolVersion {
            version: vec![2, 3000, 1],
            is_latest: true,
        })
    }

    async fn request_pairing_code(
        &self,
        phone_number: &str,
    ) -> std::result::Result<String, TransportError> {
        self.record(format!("pairing:{phone_number}"));
        Ok("ABCD-1234".into())
    }

    async fn group_metadata(&self, jid: &str) -> std::result::Result<GroupMetadata, TransportError> {
        self.record(format!("group:{jid}"));
        self.groups
            .get(jid)
            .cloned()
            .ok_or_else(|| TransportError::with_status(404, "item-not-found"))
    }

    async fn profile_picture_url(
        &self,
        jid: &str,
    ) -> std::result::Result<Option<String>, TransportError> {
        self.record(format!("picture:{jid}"));
        if jid.starts_with("broken") {
            return Err(TransportError::with_status(401, "not-authorized"));
        }
        Ok(Some(format!("https://pps.example/{jid}.jpg")))
    }

    async fn send_message(&self, jid: &str, _text: &str) -> std::result::Result<String, TransportError> {
        self.record(format!("send:{jid}"));
        Ok("3EB0".into())
    }

    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn close(&self) {
        if let Some(log) = &self.status_log {
            log.record();
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted sessions in order; an `Err` entry fails that connect.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<std::result::Result<(Arc<MockTransport>, Vec<EventBatch>), TransportError>>>,
    /// Senders kept alive so a session's stream stays open after its script.
    open_streams: Mutex<Vec<mpsc::Sender<EventBatch>>>,
    keep_open: bool,
    status_log: Option<Arc<StatusLog>>,
    pub connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(
        script: Vec<std::result::Result<(Arc<MockTransport>, Vec<EventBatch>), TransportError>>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            open_streams: Mutex::new(Vec::new()),
            keep_open: true,
            status_log: None,
            connects: AtomicUsize::new(0),
        }
    }

    /// End each session's stream once its scripted batches are consumed.
    pub fn with_closed_streams(mut self) -> Self {
        self.keep_open = false;
        self
    }

    pub fn with_status_log(mut self, log: Arc<StatusLog>) -> Self {
        self.status_log = Some(log);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self) -> std::result::Result<Session, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.status_log {
            log.record();
        }
        let next = self.script.lock().unwrap().pop_front();
        let (transport, batches) = match next {
            Some(entry) => entry?,
            None => return Err(TransportError::new("script exhausted")),
        };
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            tx.try_send(batch).unwrap();
        }
        if self.keep_open {
            self.open_streams.lock().unwrap().push(tx);
        }
        Ok(Session {
            transport,
            events: rx,
        })
    }
}

/// Captures every delivery and answers with a fixed outcome.
pub struct RecordingDispatcher {
    pub deliveries: Mutex<Vec<(Url, LinkRelayPayload)>>,
    outcome: DeliveryOutcome,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::answering(DeliveryOutcome::Delivered { status: 200 })
    }

    pub fn answering(outcome: DeliveryOutcome) -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            outcome,
        }
    }

    pub fn deliveries(&self) -> Vec<(Url, LinkRelayPayload)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkDispatcher for RecordingDispatcher {
    async fn deliver(&self, destination: &Url, payload: &LinkRelayPayload) -> DeliveryOutcome {
        self.deliveries
            .lock()
            .unwrap()
            .push((destination.clone(), payload.clone()));
        self.outcome.clone()
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    pub stored: Mutex<Option<serde_json::Value>>,
    pub fail_persist: bool,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.stored.lock().unwrap().clone())
    }

    async fn persist(&self, creds: &serde_json::Value) -> Result<()> {
        if self.fail_persist {
            return Err(Error::message("disk full"));
        }
        *self.stored.lock().unwrap() = Some(creds.clone());
        Ok(())
    }
}
