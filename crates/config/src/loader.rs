use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{
    env_subst::substitute_env,
    schema::{AuthMode, RelayConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "linkrelay.toml",
    "linkrelay.yaml",
    "linkrelay.yml",
    "linkrelay.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load config from `explicit` if given, otherwise from standard locations.
///
/// Search order without an explicit path:
/// 1. `./linkrelay.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/linkrelay/linkrelay.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RelayConfig::default()` if no config file is found or it fails
/// to load. Environment overrides are applied in every case.
pub fn discover_and_load(explicit: Option<&Path>) -> RelayConfig {
    let path = explicit.map(Path::to_path_buf).or_else(find_config_file);
    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => {
                    info!(path = %path.display(), "config loaded");
                    cfg
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    RelayConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            RelayConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Apply deployment environment variables on top of the file config.
///
/// `PORT`, `WHATSAPP_PHONE_NUMBER`, `LINKRELAY_CHANNELS_FILE`,
/// `LINKRELAY_AUTH_DIR` and `LINKRELAY_AUTH_MODE` are honored.
pub fn apply_env_overrides(config: &mut RelayConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(port) = lookup("PORT") {
        match port.trim().parse() {
            Ok(port) => config.server.port = port,
            Err(e) => warn!(value = %port, error = %e, "ignoring invalid PORT"),
        }
    }
    if let Some(phone) = lookup("WHATSAPP_PHONE_NUMBER") {
        config.whatsapp.phone_number = Some(phone.trim().trim_start_matches('+').to_string());
    }
    if let Some(file) = lookup("LINKRELAY_CHANNELS_FILE") {
        config.channels.file = PathBuf::from(file);
    }
    if let Some(dir) = lookup("LINKRELAY_AUTH_DIR") {
        config.whatsapp.auth_dir = Some(PathBuf::from(dir));
    }
    if let Some(mode) = lookup("LINKRELAY_AUTH_MODE") {
        match mode.parse::<AuthMode>() {
            Ok(mode) => config.whatsapp.auth_mode = mode,
            Err(e) => warn!(error = %e, "ignoring LINKRELAY_AUTH_MODE"),
        }
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/linkrelay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "linkrelay").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory used for credentials, falling back to `./data`.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "linkrelay")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
