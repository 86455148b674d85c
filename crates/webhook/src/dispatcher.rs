use std::{fmt, time::Duration};

use {
    async_trait::async_trait,
    linkrelay_config::WebhookConfig,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::payload::LinkRelayPayload;

const DEFAULT_USER_AGENT: &str = concat!("linkrelay/", env!("CARGO_PKG_VERSION"));
const MAX_LOGGED_BODY: usize = 256;

/// Errors raised while building the dispatcher. Deliveries never error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build webhook http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered with a 2xx status.
    Delivered { status: u16 },
    /// The endpoint answered with any other status.
    Rejected { status: u16 },
    /// No response: connect failure, timeout, or broken connection.
    TransportFailed { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered { status } => write!(f, "delivered ({status})"),
            Self::Rejected { status } => write!(f, "rejected ({status})"),
            Self::TransportFailed { reason } => write!(f, "transport failed: {reason}"),
        }
    }
}

/// Sends relay payloads to webhook endpoints.
#[async_trait]
pub trait LinkDispatcher: Send + Sync {
    async fn deliver(&self, destination: &Url, payload: &LinkRelayPayload) -> DeliveryOutcome;
}

/// HTTP webhook dispatcher. One POST per call, no retries.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Result<Self, Error> {
        Self::with_timeout(
            Duration::from_secs(config.timeout_secs.max(1)),
            config.user_agent.as_deref(),
        )
    }

    pub fn with_timeout(timeout: Duration, user_agent: Option<&str>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
            .build()?;
        Ok(Self { http, timeout })
    }

    async fn post(&self, destination: &Url, payload: &LinkRelayPayload) -> DeliveryOutcome {
        // `.json()` sets `Content-Type: application/json`.
        let resp = match self
            .http
            .post(destination.clone())
            .json(payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return DeliveryOutcome::TransportFailed {
                    reason: format!("timed out after {}s", self.timeout.as_secs_f32()),
                };
            },
            Err(e) => {
                return DeliveryOutcome::TransportFailed {
                    reason: error_chain(&e),
                };
            },
        };

        let status = resp.status();
        if status.is_success() {
            return DeliveryOutcome::Delivered {
                status: status.as_u16(),
            };
        }

        let body = resp.text().await.unwrap_or_default();
        if !body.is_empty() {
            let snippet: String = body.chars().take(MAX_LOGGED_BODY).collect();
            debug!(status = status.as_u16(), body = %snippet, "webhook rejection body");
        }
        DeliveryOutcome::Rejected {
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl LinkDispatcher for WebhookDispatcher {
    async fn deliver(&self, destination: &Url, payload: &LinkRelayPayload) -> DeliveryOutcome {
        let outcome = self.post(destination, payload).await;
        match &outcome {
            DeliveryOutcome::Delivered { status } => info!(
                channel = %payload.channel_name,
                link = %payload.link,
                status,
                "link relayed to webhook"
            ),
            DeliveryOutcome::Rejected { status } => warn!(
                channel = %payload.channel_name,
                link = %payload.link,
                destination = %destination,
                status,
                "webhook rejected link"
            ),
            DeliveryOutcome::TransportFailed { reason } => warn!(
                channel = %payload.channel_name,
                link = %payload.link,
                destination = %destination,
                reason = %reason,
                "webhook delivery failed"
            ),
        }
        outcome
    }
}

/// Flatten an error and its sources into one line; reqwest hides the root
/// cause (e.g. "connection refused") in the source chain.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    fn payload() -> LinkRelayPayload {
        LinkRelayPayload {
            link: "https://a.example/x".into(),
            sender: "own account".into(),
            channel_name: "G1".into(),
            timestamp: 1_700_000_000,
            original_message: "check https://a.example/x".into(),
            is_self_originated: true,
        }
    }

    fn dispatcher() -> WebhookDispatcher {
        WebhookDispatcher::with_timeout(Duration::from_secs(5), None).unwrap()
    }

    #[tokio::test]
    async fn delivered_on_2xx_with_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "link": "https://a.example/x",
                "sender": "own account",
                "groupName": "G1",
                "timestamp": 1_700_000_000,
                "originalMessage": "check https://a.example/x",
                "isOwnMessage": true,
            })))
            .with_status(202)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/hook", server.url())).unwrap();
        let outcome = dispatcher().deliver(&url, &payload()).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 202 });
        assert!(outcome.is_delivered());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_rejected_not_propagated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("scenario failed")
            .expect(1)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/hook", server.url())).unwrap();
        let outcome = dispatcher().deliver(&url, &payload()).await;

        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 500 });
        // Exactly one attempt, no retry.
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_error_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(404)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/hook", server.url())).unwrap();
        let outcome = dispatcher().deliver(&url, &payload()).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 404 });
        assert!(!outcome.is_delivered());
    }

    #[tokio::test]
    async fn connection_refused_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/hook")).unwrap();
        let outcome = dispatcher().deliver(&url, &payload()).await;
        assert!(
            matches!(outcome, DeliveryOutcome::TransportFailed { .. }),
            "unexpected outcome: {outcome}"
        );
    }

    #[tokio::test]
    async fn hanging_endpoint_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections and never answer.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dispatcher =
            WebhookDispatcher::with_timeout(Duration::from_millis(200), Some("linkrelay-test"))
                .unwrap();
        let url = Url::parse(&format!("http://{addr}/hook")).unwrap();
        let outcome = dispatcher.deliver(&url, &payload()).await;

        match outcome {
            DeliveryOutcome::TransportFailed { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other}"),
        }
        server.abort();
    }
}
