//! Monitored channel registry and link extraction.
//!
//! The registry is built once at startup from the channel list file (or the
//! configured fallback list) and is read-only for the process lifetime.

pub mod error;
pub mod links;
pub mod registry;

pub use {
    error::{Error, Result},
    links::{ChannelKind, extract_links},
    registry::ChannelRegistry,
};
