//! Spawning and supervising the Baileys sidecar process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    async_trait::async_trait,
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::{Child, Command},
        sync::Mutex,
    },
    tracing::{debug, error, info, warn},
};

use crate::{
    sidecar::DEFAULT_SIDECAR_PORT,
    transport::{Session, TransportConnector, TransportError},
};

/// Environment variable pointing at the sidecar checkout.
pub const SIDECAR_DIR_ENV: &str = "LINKRELAY_SIDECAR_DIR";

const SIDECAR_SUBDIR: &str = "sidecar/whatsapp-baileys";
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Handle to a running sidecar process.
pub struct SidecarProcess {
    child: Child,
    port: u16,
}

impl SidecarProcess {
    fn new(child: Child, port: u16) -> Self {
        Self { child, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the sidecar to exit, killing it if it is still alive after 5s.
    pub async fn stop(&mut self) -> Result<()> {
        info!(port = self.port, "stopping whatsapp sidecar");

        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };

            if let Some(pid) = self.child.id()
                && let Ok(pid) = i32::try_from(pid)
            {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill().await;
        }

        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "whatsapp sidecar exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for sidecar process"),
            Err(_) => {
                warn!("sidecar did not exit after SIGTERM, killing");
                self.child
                    .kill()
                    .await
                    .context("failed to kill sidecar process")?;
            },
        }
        Ok(())
    }
}

/// How to launch the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Directory containing the sidecar `package.json`.
    pub sidecar_dir: PathBuf,
    pub port: u16,
    /// Passed through so the sidecar keeps its own key material next to ours.
    pub auth_dir: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            sidecar_dir: PathBuf::new(),
            port: DEFAULT_SIDECAR_PORT,
            auth_dir: None,
        }
    }
}

/// Locate the sidecar checkout.
///
/// Tried in order: the explicit path, `LINKRELAY_SIDECAR_DIR`, paths next to
/// the executable, then paths relative to the working directory.
pub fn find_sidecar_dir(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        if has_package_json(path) {
            return Ok(path.to_path_buf());
        }
        bail!(
            "sidecar directory does not exist or is missing package.json: {}",
            path.display()
        );
    }

    if let Ok(dir) = std::env::var(SIDECAR_DIR_ENV) {
        let path = PathBuf::from(&dir);
        if has_package_json(&path) {
            return Ok(path);
        }
        warn!(path = %dir, "{SIDECAR_DIR_ENV} set but package.json not found");
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for prefix in ["..", "../.."] {
            let candidate = exe_dir.join(prefix).join(SIDECAR_SUBDIR);
            if has_package_json(&candidate) {
                return Ok(candidate);
            }
        }
    }

    for prefix in [".", "..", "../.."] {
        let path = Path::new(prefix).join(SIDECAR_SUBDIR);
        if has_package_json(&path) {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    bail!("whatsapp sidecar not found; set {SIDECAR_DIR_ENV} or check out {SIDECAR_SUBDIR}")
}

fn has_package_json(dir: &Path) -> bool {
    dir.join("package.json").exists()
}

/// Whether `dist/index.js` exists.
pub fn is_sidecar_built(sidecar_dir: &Path) -> bool {
    sidecar_dir.join("dist/index.js").exists()
}

pub fn has_node_modules(sidecar_dir: &Path) -> bool {
    sidecar_dir.join("node_modules").exists()
}

/// Build the sidecar if needed, spawn it and forward its output to tracing.
pub async fn start_sidecar(config: SidecarConfig) -> Result<SidecarProcess> {
    let sidecar_dir = &config.sidecar_dir;
    if !has_package_json(sidecar_dir) {
        bail!(
            "whatsapp sidecar not found at {}; run `npm install && npm run build` there first",
            sidecar_dir.display()
        );
    }

    if !is_sidecar_built(sidecar_dir) {
        info!(path = %sidecar_dir.display(), "building whatsapp sidecar");
        if !has_node_modules(sidecar_dir) {
            run_npm(sidecar_dir, &["install"]).await?;
        }
        run_npm(sidecar_dir, &["run", "build"]).await?;
    }

    info!(path = %sidecar_dir.display(), port = config.port, "starting whatsapp sidecar");

    let mut cmd = Command::new("node");
    cmd.arg("dist/index.js")
        .current_dir(sidecar_dir)
        .env("LINKRELAY_SIDECAR_PORT", config.port.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(auth_dir) = &config.auth_dir {
        cmd.env("LINKRELAY_AUTH_DIR", auth_dir);
    }

    let mut child = cmd.spawn().context("failed to spawn sidecar process")?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                forward_log_line(&line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "whatsapp_sidecar", "{line}");
            }
        });
    }

    // Catch immediate crashes (missing node, port in use) before connecting.
    tokio::time::sleep(STARTUP_GRACE).await;
    match child.try_wait() {
        Ok(Some(status)) => bail!("sidecar process exited immediately with status: {status}"),
        Ok(None) => {},
        Err(e) => bail!("failed to check sidecar process status: {e}"),
    }

    info!(port = config.port, "whatsapp sidecar started");
    Ok(SidecarProcess::new(child, config.port))
}

/// Something that can bring up a sidecar process.
#[async_trait]
pub trait SidecarLauncher: Send + Sync {
    async fn launch(&self) -> Result<SidecarProcess>;
}

#[async_trait]
impl SidecarLauncher for SidecarConfig {
    async fn launch(&self) -> Result<SidecarProcess> {
        start_sidecar(self.clone()).await
    }
}

/// Connector that respawns the sidecar process before connecting if it died.
pub struct ManagedSidecar {
    launcher: Box<dyn SidecarLauncher>,
    connector: Arc<dyn TransportConnector>,
    process: Mutex<Option<SidecarProcess>>,
}

impl ManagedSidecar {
    pub fn new(
        launcher: impl SidecarLauncher + 'static,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            launcher: Box::new(launcher),
            connector,
            process: Mutex::new(None),
        }
    }

    /// Start the sidecar unless a live process is already attached.
    pub async fn ensure_running(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(proc) = process.as_mut() {
            if proc.is_running() {
                return Ok(());
            }
            warn!(port = proc.port(), "sidecar process died, restarting");
        }
        *process = Some(self.launcher.launch().await?);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(proc) = process.as_mut() {
            proc.stop().await?;
        }
        *process = None;
        Ok(())
    }
}

#[async_trait]
impl TransportConnector for ManagedSidecar {
    async fn connect(&self) -> std::result::Result<Session, TransportError> {
        self.ensure_running()
            .await
            .map_err(|e| TransportError::new(format!("sidecar unavailable: {e:#}")))?;
        self.connector.connect().await
    }
}

/// Pino numeric level of a sidecar log line, with its message.
fn parse_pino_line(line: &str) -> Option<(u64, String)> {
    if !line.starts_with('{') {
        return None;
    }
    let log: serde_json::Value = serde_json::from_str(line).ok()?;
    let level = log
        .get("level")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(30);
    let msg = log
        .get("msg")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(line)
        .to_string();
    Some((level, msg))
}

fn forward_log_line(line: &str) {
    match parse_pino_line(line) {
        Some((10 | 20, msg)) => debug!(target: "whatsapp_sidecar", "{msg}"),
        Some((30, msg)) => info!(target: "whatsapp_sidecar", "{msg}"),
        Some((40, msg)) => warn!(target: "whatsapp_sidecar", "{msg}"),
        Some((_, msg)) => error!(target: "whatsapp_sidecar", "{msg}"),
        None => info!(target: "whatsapp_sidecar", "{line}"),
    }
}

async fn run_npm(sidecar_dir: &Path, args: &[&str]) -> Result<()> {
    let label = args.join(" ");
    info!(path = %sidecar_dir.display(), "running npm {label} for sidecar");

    let output = Command::new("npm")
        .args(args)
        .current_dir(sidecar_dir)
        .output()
        .await
        .with_context(|| format!("failed to run npm {label}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("npm {label} failed: {stderr}");
    }
    Ok(())
}
