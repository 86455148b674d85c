//! Configuration loading, env substitution, and environment overrides.
//!
//! Config files: `linkrelay.toml`, `linkrelay.yaml`, or `linkrelay.json`
//! Searched in `./` then `~/.config/linkrelay/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, config_dir, data_dir, discover_and_load, load_config},
    schema::{
        AuthMode, ChannelConfig, ChannelsConfig, RelayConfig, ServerConfig, SidecarSettings,
        WebhookConfig, WhatsAppConfig,
    },
};
