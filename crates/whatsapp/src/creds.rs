//! Credential persistence for the WhatsApp Web session.

use std::path::PathBuf;

use {async_trait::async_trait, tracing::debug};

use crate::error::{Context, Result};

const CREDS_FILE: &str = "creds.json";

/// Loads and persists the transport's credential state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials saved by a previous run, if any.
    async fn load(&self) -> Result<Option<serde_json::Value>>;

    async fn persist(&self, creds: &serde_json::Value) -> Result<()>;
}

/// Stores credentials as `creds.json` inside an auth directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<serde_json::Value>> {
        let path = self.path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored credentials");
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };
        let creds = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt credentials in {}", path.display()))?;
        Ok(Some(creds))
    }

    async fn persist(&self, creds: &serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating auth dir {}", self.dir.display()))?;

        // Write then rename so a crash never leaves a truncated file behind.
        let path = self.path();
        let tmp = self.dir.join(format!("{CREDS_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(creds)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        debug!(path = %path.display(), "credentials persisted");
        Ok(())
    }
}
