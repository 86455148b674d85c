//! Session supervision: build, authenticate, observe and rebuild sessions.

use std::{sync::Arc, time::Duration};

use {
    linkrelay_channels::{ChannelKind, ChannelRegistry},
    linkrelay_common::{ConnectionState, StatusPublisher},
    linkrelay_config::{AuthMode, WhatsAppConfig},
    linkrelay_webhook::LinkDispatcher,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    creds::CredentialStore,
    error::{Error, Result},
    router::EventRouter,
    transport::{Session, SessionOptions, Transport, TransportConnector},
    types::{ConnectionPhase, ConnectionUpdate, DisconnectReason},
};

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device was unlinked; credentials must be re-enrolled.
    LoggedOut,
    /// Shutdown was requested.
    Cancelled,
}

/// Session settings the supervisor needs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub auth_mode: AuthMode,
    pub phone_number: Option<String>,
    pub sync_full_history: bool,
    /// Pause after a session could not be constructed or started.
    pub reconnect_delay: Duration,
}

impl SupervisorConfig {
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self {
            auth_mode: config.auth_mode,
            phone_number: config
                .phone_number
                .clone()
                .filter(|p| !p.trim().is_empty()),
            sync_full_history: config.sync_full_history,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

enum Attempt {
    /// Rebuild right away.
    Restart(DisconnectReason),
    /// Rebuild after `reconnect_delay`.
    Retry,
    End(SessionEnd),
}

/// Owns the session loop and the single writer of the connection state.
pub struct SessionSupervisor {
    connector: Arc<dyn TransportConnector>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<dyn LinkDispatcher>,
    creds: Arc<dyn CredentialStore>,
    status: StatusPublisher,
    config: SupervisorConfig,
    restarts: u64,
}

impl SessionSupervisor {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        registry: Arc<ChannelRegistry>,
        dispatcher: Arc<dyn LinkDispatcher>,
        creds: Arc<dyn CredentialStore>,
        status: StatusPublisher,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            connector,
            registry,
            dispatcher,
            creds,
            status,
            config,
            restarts: 0,
        }
    }

    /// Number of sessions rebuilt after a disconnect.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Run sessions until logout, cancellation, or a fatal authentication error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionEnd> {
        loop {
            self.status.set(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(self.finish(SessionEnd::Cancelled)),
                connected = self.connector.connect() => connected,
            };

            let attempt = match connected {
                Ok(session) => self.run_session(session, &cancel).await?,
                Err(e) => {
                    warn!(error = %e, "failed to construct session");
                    Attempt::Retry
                },
            };

            match attempt {
                Attempt::End(end) => return Ok(self.finish(end)),
                Attempt::Restart(reason) => {
                    self.restarts += 1;
                    info!(%reason, restarts = self.restarts, "rebuilding session");
                },
                Attempt::Retry => {
                    debug!(delay = ?self.config.reconnect_delay, "retrying session");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(self.finish(SessionEnd::Cancelled)),
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {},
                    }
                },
            }
        }
    }

    fn finish(&self, end: SessionEnd) -> SessionEnd {
        self.status.set(ConnectionState::Closed);
        end
    }

    async fn run_session(&self, session: Session, cancel: &CancellationToken) -> Result<Attempt> {
        let Session {
            transport,
            mut events,
        } = session;

        if let Err(e) = self.start(transport.as_ref()).await {
            warn!(error = %e, "failed to start session");
            transport.close().await;
            return Ok(Attempt::Retry);
        }

        let (connection_tx, mut connection_rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.creds),
            Arc::clone(&transport),
            connection_tx,
        );
        let mut pairing_requested = false;

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => {
                    transport.close().await;
                    return Ok(Attempt::End(SessionEnd::Cancelled));
                },
                batch = events.recv() => batch,
            };
            let Some(batch) = batch else {
                warn!("event stream ended without a close update");
                self.status.set(ConnectionState::Closed);
                transport.close().await;
                return Ok(Attempt::Restart(DisconnectReason::Other(None)));
            };

            for event in batch {
                router.route(event).await;
                while let Ok(update) = connection_rx.try_recv() {
                    let handled = self
                        .on_connection_update(transport.as_ref(), update, &mut pairing_requested)
                        .await;
                    match handled {
                        Ok(None) => {},
                        Ok(Some(attempt)) => {
                            transport.close().await;
                            return Ok(attempt);
                        },
                        Err(e) => {
                            transport.close().await;
                            self.status.set(ConnectionState::Closed);
                            return Err(e);
                        },
                    }
                }
            }
        }
    }

    async fn start(&self, transport: &dyn Transport) -> Result<()> {
        let version = match transport.fetch_latest_version().await {
            Ok(v) => {
                info!(version = %v.dotted(), is_latest = v.is_latest, "using whatsapp web version");
                Some(v.version)
            },
            Err(e) => {
                warn!(error = %e, "could not fetch latest version, using transport default");
                None
            },
        };

        let creds = match self.creds.load().await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "stored credentials unusable, starting fresh enrollment");
                None
            },
        };

        transport
            .start(SessionOptions {
                creds,
                version,
                sync_full_history: self.config.sync_full_history,
            })
            .await?;
        Ok(())
    }

    async fn on_connection_update(
        &self,
        transport: &dyn Transport,
        update: ConnectionUpdate,
        pairing_requested: &mut bool,
    ) -> Result<Option<Attempt>> {
        if let Some(qr) = update.qr.as_deref() {
            self.status.set(ConnectionState::AwaitingCredentials);
            self.enroll(transport, qr, pairing_requested).await?;
        }

        match update.connection {
            Some(ConnectionPhase::Open) => {
                self.status.set(ConnectionState::Open);
                info!(
                    channels = self.registry.len(),
                    new_login = ?update.is_new_login,
                    "whatsapp session open"
                );
                self.report_channels(transport).await;
            },
            Some(ConnectionPhase::Close) => {
                self.status.set(ConnectionState::Closed);
                let last = update.last_disconnect.unwrap_or_default();
                let reason = DisconnectReason::from_status(last.status_code);
                if !reason.should_restart() {
                    error!(%reason, "session logged out, re-enrollment required");
                    return Ok(Some(Attempt::End(SessionEnd::LoggedOut)));
                }
                info!(%reason, message = ?last.message, "session closed");
                return Ok(Some(Attempt::Restart(reason)));
            },
            Some(ConnectionPhase::Connecting) => debug!("session connecting"),
            None => {},
        }
        Ok(None)
    }

    async fn enroll(
        &self,
        transport: &dyn Transport,
        qr: &str,
        pairing_requested: &mut bool,
    ) -> Result<()> {
        match self.config.auth_mode {
            AuthMode::Qr => {
                info!(qr, "scan this QR token from WhatsApp > Linked devices");
            },
            AuthMode::PairingCode if transport.is_registered() => {
                debug!("credentials already registered, ignoring bootstrap token");
            },
            AuthMode::PairingCode => {
                let Some(phone) = self.config.phone_number.as_deref() else {
                    return Err(Error::AuthenticationMissingInput);
                };
                if *pairing_requested {
                    return Ok(());
                }
                *pairing_requested = true;
                match transport.request_pairing_code(phone).await {
                    Ok(code) => info!(code = %code, "enter this pairing code in WhatsApp > Linked devices"),
                    Err(e) => warn!(error = %e, "pairing code request failed"),
                }
            },
        }
        Ok(())
    }

    /// Log membership details for every monitored group.
    async fn report_channels(&self, transport: &dyn Transport) {
        for channel in self.registry.iter() {
            if ChannelKind::of(&channel.identifier) != ChannelKind::Group {
                continue;
            }
            match transport.group_metadata(&channel.identifier).await {
                Ok(meta) => {
                    let created = meta
                        .creation
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                        .map(|at| at.format("%Y-%m-%d").to_string());
                    info!(
                        channel = %channel.display_name,
                        subject = ?meta.subject,
                        participants = meta.participants.len(),
                        created = ?created,
                        "monitoring group"
                    );
                },
                Err(e) => warn!(
                    channel = %channel.display_name,
                    identifier = %channel.identifier,
                    error = %e,
                    "group not found or not a member"
                ),
            }
        }
    }
}
