use std::path::PathBuf;

/// Crate-wide result type for channel list operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading the channel list.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel list file could not be read.
    #[error("failed to read channel list {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but its contents are not a valid channel list.
    #[error("invalid channel list {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The file extension does not map to a supported format.
    #[error("unsupported channel list format: .{extension}")]
    UnsupportedFormat { extension: String },
}

impl Error {
    #[must_use]
    pub fn parse(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
