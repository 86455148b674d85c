use std::{path::PathBuf, process::ExitCode, sync::Arc};

use {
    clap::Parser,
    linkrelay_channels::ChannelRegistry,
    linkrelay_common::status_channel,
    linkrelay_config::{AuthMode, RelayConfig},
    linkrelay_gateway::{GatewayState, start_health_server},
    linkrelay_webhook::WebhookDispatcher,
    linkrelay_whatsapp::{
        Error as SessionError, FileCredentialStore, ManagedSidecar, SessionEnd,
        SessionSupervisor, SidecarConfig, SidecarConnector, SupervisorConfig, TransportConnector,
        find_sidecar_dir,
    },
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser, Debug)]
#[command(
    name = "linkrelay",
    version,
    about = "Relay links posted in WhatsApp chats to per-chat webhooks"
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to linkrelay.{toml,yaml,json} in ./ or the user config dir).
    #[arg(long, env = "LINKRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address the health endpoint binds to (overrides config value).
    #[arg(long)]
    bind: Option<String>,

    /// Port the health endpoint listens on (overrides config value).
    #[arg(long)]
    port: Option<u16>,

    /// Enroll with a pairing code for WHATSAPP_PHONE_NUMBER instead of a QR code.
    #[arg(long, default_value_t = false)]
    use_pairing_code: bool,

    /// Do not spawn the sidecar; connect to one that is already running.
    #[arg(long, default_value_t = false)]
    no_sidecar: bool,
}

impl Cli {
    /// Flags win over the config file and environment.
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.use_pairing_code {
            config.whatsapp.auth_mode = AuthMode::PairingCode;
        }
        if self.no_sidecar {
            config.whatsapp.sidecar.auto_start = false;
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "linkrelay starting");

    let mut config = linkrelay_config::discover_and_load(cli.config.as_deref());
    cli.apply_overrides(&mut config);

    let registry = Arc::new(ChannelRegistry::load_or_fallback(
        &config.channels.file,
        &config.channels.fallback,
    ));
    if registry.is_empty() {
        warn!("no channels are monitored, links will not be relayed");
    }
    for channel in registry.iter() {
        info!(
            channel = %channel.display_name,
            identifier = %channel.identifier,
            webhook = %channel.webhook_url,
            "monitoring channel"
        );
    }

    let dispatcher = Arc::new(WebhookDispatcher::new(&config.webhook)?);
    let auth_dir = config
        .whatsapp
        .auth_dir
        .clone()
        .unwrap_or_else(|| linkrelay_config::data_dir().join("auth"));
    let creds = Arc::new(FileCredentialStore::new(&auth_dir));

    let shutdown = CancellationToken::new();
    let (publisher, status) = status_channel();

    let health = {
        let state = GatewayState::new(status, registry.len());
        let bind = config.server.bind.clone();
        let port = config.server.port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_health_server(&bind, port, state, shutdown).await {
                error!(bind = %bind, port, error = %e, "health endpoint failed");
            }
        })
    };

    let sidecar_connector = Arc::new(SidecarConnector::new(config.whatsapp.sidecar.port));
    let sidecar = if config.whatsapp.sidecar.auto_start {
        let sidecar_dir = find_sidecar_dir(config.whatsapp.sidecar.dir.as_deref())?;
        let managed = Arc::new(ManagedSidecar::new(
            SidecarConfig {
                sidecar_dir,
                port: config.whatsapp.sidecar.port,
                auth_dir: Some(auth_dir.clone()),
            },
            sidecar_connector.clone(),
        ));
        managed.ensure_running().await?;
        Some(managed)
    } else {
        info!(port = config.whatsapp.sidecar.port, "using externally managed sidecar");
        None
    };
    let connector: Arc<dyn TransportConnector> = match &sidecar {
        Some(managed) => managed.clone(),
        None => sidecar_connector,
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let mut supervisor = SessionSupervisor::new(
        connector,
        registry,
        dispatcher,
        creds,
        publisher,
        SupervisorConfig::from_config(&config.whatsapp),
    );
    let outcome = supervisor.run(shutdown.clone()).await;

    shutdown.cancel();
    stop_sidecar(sidecar.as_deref()).await;
    if let Err(e) = health.await {
        warn!(error = %e, "health endpoint task panicked");
    }

    match outcome {
        Ok(SessionEnd::Cancelled) => {
            info!("linkrelay stopped");
            Ok(ExitCode::SUCCESS)
        },
        Ok(SessionEnd::LoggedOut) => {
            error!(
                auth_dir = %auth_dir.display(),
                "logged out; remove the stored credentials and restart to enroll again"
            );
            Ok(ExitCode::FAILURE)
        },
        Err(e @ SessionError::AuthenticationMissingInput) => {
            error!(error = %e, "cannot enroll");
            Ok(ExitCode::FAILURE)
        },
        Err(e) => Err(e.into()),
    }
}

async fn stop_sidecar(sidecar: Option<&ManagedSidecar>) {
    if let Some(sidecar) = sidecar
        && let Err(e) = sidecar.stop().await
    {
        warn!(error = %e, "failed to stop sidecar");
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                tokio::signal::ctrl_c().await.ok();
            },
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "linkrelay",
            "--bind",
            "127.0.0.1",
            "--port",
            "8080",
            "--use-pairing-code",
            "--no-sidecar",
        ])
        .unwrap();
        let mut config = RelayConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.whatsapp.auth_mode, AuthMode::PairingCode);
        assert!(!config.whatsapp.sidecar.auto_start);
    }

    #[test]
    fn defaults_leave_config_alone() {
        let cli = Cli::try_parse_from(["linkrelay"]).unwrap();
        let mut config = RelayConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.whatsapp.auth_mode, AuthMode::Qr);
        assert!(config.whatsapp.sidecar.auto_start);
        assert_eq!(cli.log_level, "info");
    }
}
