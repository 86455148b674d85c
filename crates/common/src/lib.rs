//! Shared types, error definitions, and utilities used across all linkrelay crates.

pub mod error;
pub mod types;

pub use {
    error::{Error, FromMessage, Result},
    types::{ConnectionState, StatusHandle, StatusPublisher, status_channel},
};
