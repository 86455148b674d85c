use std::{collections::HashMap, path::Path};

use {
    linkrelay_config::ChannelConfig,
    serde::Deserialize,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

/// Read-only allow-list of monitored channels.
///
/// Only enabled entries are kept. When the same identifier appears more
/// than once the last entry wins, including its `enabled` flag.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<ChannelConfig>,
    index: HashMap<String, usize>,
}

/// Accepted channel list layouts.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelFile {
    List(Vec<ChannelConfig>),
    Document {
        #[serde(alias = "monitoredGroups")]
        channels: Vec<ChannelConfig>,
    },
}

impl ChannelFile {
    fn into_channels(self) -> Vec<ChannelConfig> {
        match self {
            Self::List(channels) | Self::Document { channels } => channels,
        }
    }
}

impl ChannelRegistry {
    pub fn new(candidates: impl IntoIterator<Item = ChannelConfig>) -> Self {
        let mut deduped: Vec<ChannelConfig> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for candidate in candidates {
            match positions.get(&candidate.identifier) {
                Some(&pos) => {
                    warn!(
                        identifier = %candidate.identifier,
                        replaced = %deduped[pos].display_name,
                        by = %candidate.display_name,
                        "duplicate channel identifier, last entry wins"
                    );
                    deduped[pos] = candidate;
                },
                None => {
                    positions.insert(candidate.identifier.clone(), deduped.len());
                    deduped.push(candidate);
                },
            }
        }

        let total = deduped.len();
        let channels: Vec<ChannelConfig> = deduped
            .into_iter()
            .filter(|c| {
                if !c.enabled {
                    debug!(identifier = %c.identifier, name = %c.display_name, "channel disabled");
                }
                c.enabled
            })
            .collect();
        let index = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.identifier.clone(), i))
            .collect();

        info!(active = channels.len(), total, "channel registry built");
        for channel in &channels {
            debug!(
                identifier = %channel.identifier,
                name = %channel.display_name,
                webhook = %channel.webhook_url,
                note = ?channel.note,
                "monitoring channel"
            );
        }

        Self { channels, index }
    }

    /// Parse a channel list file (JSON, TOML or YAML by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let file: ChannelFile = match ext {
            "json" => serde_json::from_str(&raw).map_err(|e| Error::parse(path, e))?,
            "toml" => toml::from_str(&raw).map_err(|e| Error::parse(path, e))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| Error::parse(path, e))?,
            other => {
                return Err(Error::UnsupportedFormat {
                    extension: other.to_string(),
                });
            },
        };
        info!(path = %path.display(), "channel list loaded");
        Ok(Self::new(file.into_channels()))
    }

    /// Load the channel list, degrading to `fallback` when the file is unusable.
    pub fn load_or_fallback(path: &Path, fallback: &[ChannelConfig]) -> Self {
        match Self::load(path) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    fallback_channels = fallback.len(),
                    "channel list unavailable, running in degraded mode with fallback channels"
                );
                let registry = Self::new(fallback.iter().cloned());
                if registry.is_empty() {
                    warn!("no fallback channels configured, zero channels active");
                }
                registry
            },
        }
    }

    pub fn lookup(&self, identifier: &str) -> Option<&ChannelConfig> {
        self.index.get(identifier).map(|&i| &self.channels[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
