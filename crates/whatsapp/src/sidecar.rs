//! WebSocket client for the Baileys sidecar.
//!
//! The sidecar owns the WhatsApp Web protocol. We exchange JSON text frames:
//! requests carry a `request_id` that the matching `response` echoes, and
//! event batches are pushed unsolicited.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tokio::sync::{mpsc, oneshot},
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tracing::{debug, info, trace, warn},
};

use crate::{
    transport::{
        EventBatch, GroupMetadata, ProtocolVersion, Session, SessionOptions, Transport,
        TransportConnector, TransportError,
    },
    types::InboundEvent,
};

/// Default port for the sidecar WebSocket server.
pub const DEFAULT_SIDECAR_PORT: u16 = 3180;

const EVENT_QUEUE_DEPTH: usize = 64;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, TransportError>>>>;

/// Frames sent to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Start {
        request_id: String,
        options: SessionOptions,
    },
    FetchLatestVersion {
        request_id: String,
    },
    RequestPairingCode {
        request_id: String,
        phone_number: String,
    },
    GroupMetadata {
        request_id: String,
        jid: String,
    },
    ProfilePictureUrl {
        request_id: String,
        jid: String,
    },
    SendMessage {
        request_id: String,
        jid: String,
        text: String,
    },
    Close,
}

/// Frames received from the sidecar.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Events {
        /// Decoded one event at a time so a bad entry does not sink its batch.
        batch: Vec<serde_json::Value>,
    },
    Response {
        request_id: String,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<TransportError>,
    },
}

/// Opens a new sidecar connection for every session.
#[derive(Debug, Clone)]
pub struct SidecarConnector {
    url: String,
    connect_attempts: u32,
    request_timeout: Duration,
}

impl SidecarConnector {
    pub fn new(port: u16) -> Self {
        Self::with_url(format!("ws://127.0.0.1:{port}"))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_attempts: 10,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportConnector for SidecarConnector {
    async fn connect(&self) -> Result<Session, TransportError> {
        let ws = connect_with_retry(&self.url, self.connect_attempts).await?;
        let (mut ws_sink, mut ws_reader) = ws.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::channel::<EventBatch>(EVENT_QUEUE_DEPTH);
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<EventBatch>();
        let shared = Arc::new(Shared::default());

        // The reader never waits on the session's queue, so responses keep
        // flowing while the consumer is blocked on a request.
        tokio::spawn(async move {
            while let Some(batch) = forward_rx.recv().await {
                if events_tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sink.send(msg).await {
                    debug!(error = %e, "sidecar writer stopped");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let pong_tx = write_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if !reader_shared.dispatch(&text, &forward_tx) {
                            break;
                        }
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "sidecar closed the connection");
                        break;
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!(error = %e, "sidecar connection error");
                        break;
                    },
                }
            }
            reader_shared.fail_pending("sidecar connection closed");
            // Dropping `forward_tx` ends the session's event stream once the
            // forwarder has drained what is queued.
        });

        info!(url = %self.url, "connected to whatsapp sidecar");
        let transport = SidecarTransport {
            write_tx,
            shared,
            request_timeout: self.request_timeout,
        };
        Ok(Session {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

#[derive(Default)]
struct Shared {
    pending: PendingMap,
    registered: AtomicBool,
}

impl Shared {
    /// Handle one text frame. Returns `false` once the event consumer is gone.
    fn dispatch(&self, text: &str, events_tx: &mpsc::UnboundedSender<EventBatch>) -> bool {
        let msg = match serde_json::from_str::<SidecarMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "ignoring malformed sidecar frame");
                trace!(frame = text, "malformed sidecar frame");
                return true;
            },
        };

        match msg {
            SidecarMessage::Events { batch } => {
                let batch = decode_batch(batch);
                for event in &batch {
                    if let InboundEvent::CredentialsUpdate(creds) = event {
                        self.registered
                            .store(creds_registered(creds), Ordering::Relaxed);
                    }
                }
                batch.is_empty() || events_tx.send(batch).is_ok()
            },
            SidecarMessage::Response {
                request_id,
                result,
                error,
            } => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            Some(err) => Err(err),
                            None => Ok(result.unwrap_or(serde_json::Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    },
                    None => debug!(request_id, "response for unknown or expired request"),
                }
                true
            },
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::new(reason)));
        }
    }
}

/// Decode each event on its own, dropping only the ones that do not parse.
fn decode_batch(raw: Vec<serde_json::Value>) -> EventBatch {
    raw.into_iter()
        .filter_map(|value| {
            let kind = value
                .get("event")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("<missing>")
                .to_string();
            match serde_json::from_value::<InboundEvent>(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(event = %kind, error = %e, "skipping malformed sidecar event");
                    None
                },
            }
        })
        .collect()
}

fn creds_registered(creds: &serde_json::Value) -> bool {
    creds
        .get("registered")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Live session backed by one sidecar WebSocket connection.
pub struct SidecarTransport {
    write_tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl SidecarTransport {
    async fn request<T: DeserializeOwned>(
        &self,
        build: impl FnOnce(String) -> GatewayMessage,
    ) -> Result<T, TransportError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&build(request_id.clone()))
            .map_err(|e| TransportError::new(format!("encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);

        if self.write_tx.send(Message::Text(frame.into())).is_err() {
            self.pending().remove(&request_id);
            return Err(TransportError::new("sidecar connection closed"));
        }

        let value = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(TransportError::new("sidecar connection closed")),
            Err(_) => {
                self.pending().remove(&request_id);
                return Err(TransportError::with_status(408, "sidecar request timed out"));
            },
        };
        serde_json::from_value(value)
            .map_err(|e| TransportError::new(format!("unexpected sidecar response: {e}")))
    }

    fn pending(
        &self,
    ) -> std::sync::MutexGuard<
        '_,
        HashMap<String, oneshot::Sender<Result<serde_json::Value, TransportError>>>,
    > {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn start(&self, options: SessionOptions) -> Result<(), TransportError> {
        if let Some(creds) = options.creds.as_ref() {
            self.shared
                .registered
                .store(creds_registered(creds), Ordering::Relaxed);
        }
        let _: serde_json::Value = self
            .request(|request_id| GatewayMessage::Start {
                request_id,
                options,
            })
            .await?;
        Ok(())
    }

    async fn fetch_latest_version(&self) -> Result<ProtocolVersion, TransportError> {
        self.request(|request_id| GatewayMessage::FetchLatestVersion { request_id })
            .await
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        let phone_number = phone_number.to_string();
        self.request(|request_id| GatewayMessage::RequestPairingCode {
            request_id,
            phone_number,
        })
        .await
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, TransportError> {
        let jid = jid.to_string();
        self.request(|request_id| GatewayMessage::GroupMetadata { request_id, jid })
            .await
    }

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, TransportError> {
        let jid = jid.to_string();
        self.request(|request_id| GatewayMessage::ProfilePictureUrl { request_id, jid })
            .await
    }

    async fn send_message(&self, jid: &str, text: &str) -> Result<String, TransportError> {
        let (jid, text) = (jid.to_string(), text.to_string());
        self.request(|request_id| GatewayMessage::SendMessage {
            request_id,
            jid,
            text,
        })
        .await
    }

    fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if let Ok(frame) = serde_json::to_string(&GatewayMessage::Close) {
            let _ = self.write_tx.send(Message::Text(frame.into()));
        }
        let _ = self.write_tx.send(Message::Close(None));
        self.shared.fail_pending("session closed");
    }
}

/// Connect to the sidecar, retrying while the process is still starting.
pub async fn connect_with_retry(url: &str, attempts: u32) -> Result<WsStream, TransportError> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match connect_async(url).await {
            Ok((ws, _response)) => return Ok(ws),
            Err(e) => {
                debug!(url, attempt, error = %e, "sidecar not reachable yet");
                last_error = Some(e);
            },
        }
        if attempt < attempts {
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }
    Err(TransportError::new(format!(
        "failed to connect to sidecar at {url}: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{ConnectionPhase, ConnectionUpdate},
        tokio::net::TcpListener,
        tokio_tungstenite::accept_async,
    };

    /// Minimal fake sidecar: answers requests and pushes one event batch after `start`.
    async fn spawn_fake_sidecar() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: serde_json::Value = serde_json::from_str(&text).unwrap();
                let request_id = req["request_id"].as_str().unwrap_or_default().to_string();
                let reply = match req["type"].as_str() {
                    Some("start") => serde_json::json!({
                        "type": "response", "request_id": request_id, "result": null
                    }),
                    Some("fetch_latest_version") => serde_json::json!({
                        "type": "response", "request_id": request_id,
                        "result": {"version": [2, 3000, 1], "isLatest": true}
                    }),
                    Some("request_pairing_code") => serde_json::json!({
                        "type": "response", "request_id": request_id,
                        "error": {"statusCode": 428, "message": "connection closed"}
                    }),
                    Some("close") => break,
                    _ => continue,
                };
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();

                if req["type"] == "start" {
                    let batch = serde_json::json!({
                        "type": "events",
                        "batch": [
                            {"event": "credentials_update", "data": {"registered": true}},
                            {"event": "connection_update", "data": {"connection": "open"}}
                        ]
                    });
                    ws.send(Message::Text(batch.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn request_response_and_events() {
        let url = spawn_fake_sidecar().await;
        let connector = SidecarConnector::with_url(url).with_connect_attempts(3);
        let mut session = connector.connect().await.unwrap();

        let version = session.transport.fetch_latest_version().await.unwrap();
        assert_eq!(version.dotted(), "2.3000.1");
        assert!(!session.transport.is_registered());

        session
            .transport
            .start(SessionOptions::default())
            .await
            .unwrap();
        let batch = session.events.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(
            &batch[1],
            InboundEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionPhase::Open),
                ..
            })
        ));
        assert!(session.transport.is_registered());

        let err = session
            .transport
            .request_pairing_code("4917000000")
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(428));

        session.transport.close().await;
        assert!(session.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn responses_are_not_held_behind_queued_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let batch = serde_json::json!({
                "type": "events",
                "batch": [{"event": "chat_delete", "data": ["1@s.whatsapp.net"]}]
            });
            for _ in 0..EVENT_QUEUE_DEPTH + 6 {
                ws.send(Message::Text(batch.to_string().into())).await.unwrap();
            }
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: serde_json::Value = serde_json::from_str(&text).unwrap();
                let reply = serde_json::json!({
                    "type": "response",
                    "request_id": req["request_id"],
                    "result": {"id": "G1@g.us", "subject": "Links"}
                });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
            }
        });

        let mut session = SidecarConnector::with_url(format!("ws://{addr}"))
            .with_request_timeout(Duration::from_secs(2))
            .connect()
            .await
            .unwrap();
        // Give the reader time to take in every batch before asking.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let group = session.transport.group_metadata("G1@g.us").await.unwrap();
        assert_eq!(group.subject.as_deref(), Some("Links"));

        let mut received = 0;
        while received < EVENT_QUEUE_DEPTH + 6 {
            let batch = session.events.recv().await.unwrap();
            assert!(matches!(batch[0], InboundEvent::ChatDelete(_)));
            received += 1;
        }
    }

    #[tokio::test]
    async fn malformed_event_drops_only_itself() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mixed = serde_json::json!({
                "type": "events",
                "batch": [
                    {"event": "message_upsert", "data": {"type": "notify", "messages": [{
                        "key": {"remoteJid": "G1@g.us", "fromMe": false, "id": "m1"},
                        "message": {"conversation": "see https://a.example/x"}
                    }]}},
                    {"event": "contact_update", "data": [{"notify": "Bob"}]},
                    {"event": "connection_update", "data": {
                        "connection": "close",
                        "lastDisconnect": {"statusCode": 401}
                    }}
                ]
            });
            let trailing = serde_json::json!({
                "type": "events",
                "batch": [{"event": "chat_delete", "data": ["1@s.whatsapp.net"]}]
            });
            ws.send(Message::Text(mixed.to_string().into())).await.unwrap();
            ws.send(Message::Text(trailing.to_string().into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut session = SidecarConnector::with_url(format!("ws://{addr}"))
            .connect()
            .await
            .unwrap();

        let first = session.events.recv().await.unwrap();
        let kinds: Vec<_> = first.iter().map(InboundEvent::kind).collect();
        assert_eq!(kinds, ["message_upsert", "connection_update"]);

        let second = session.events.recv().await.unwrap();
        assert_eq!(second[0].kind(), "chat_delete");
    }

    #[test]
    fn decodes_known_events_and_skips_the_rest() {
        let batch = decode_batch(vec![
            serde_json::json!({"event": "chat_delete", "data": ["a"]}),
            serde_json::json!({"event": "no_such_event", "data": {}}),
            serde_json::json!({"data": {}}),
            serde_json::json!({"event": "credentials_update", "data": {"registered": true}}),
        ]);
        let kinds: Vec<_> = batch.iter().map(InboundEvent::kind).collect();
        assert_eq!(kinds, ["chat_delete", "credentials_update"]);
    }

    #[tokio::test]
    async fn requests_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Read everything, answer nothing.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let session = SidecarConnector::with_url(format!("ws://{addr}"))
            .with_request_timeout(Duration::from_millis(100))
            .connect()
            .await
            .unwrap();
        let err = session
            .transport
            .group_metadata("1@g.us")
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(408));
    }

    #[tokio::test]
    async fn connect_gives_up_after_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SidecarConnector::with_url(format!("ws://{addr}"))
            .with_connect_attempts(1)
            .connect()
            .await;
        let Err(err) = result else {
            panic!("expected connect failure");
        };
        assert!(err.message.contains("failed to connect to sidecar"));
    }

    #[test]
    fn serializes_gateway_messages() {
        let frame = serde_json::to_value(GatewayMessage::RequestPairingCode {
            request_id: "r1".into(),
            phone_number: "4917000000".into(),
        })
        .unwrap();
        assert_eq!(
            frame,
            serde_json::json!({
                "type": "request_pairing_code",
                "request_id": "r1",
                "phone_number": "4917000000"
            })
        );
        assert_eq!(
            serde_json::to_value(GatewayMessage::Close).unwrap(),
            serde_json::json!({"type": "close"})
        );
    }
}
