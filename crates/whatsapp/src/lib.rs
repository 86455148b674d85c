//! WhatsApp Web session handling for linkrelay.
//!
//! The protocol itself runs in a Baileys sidecar process. This crate talks to
//! it over a local WebSocket, persists credentials, routes inbound events and
//! supervises the session through restarts until logout or shutdown.

pub mod creds;
pub mod error;
pub mod lifecycle;
pub mod process;
pub mod router;
pub mod sidecar;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use {
    creds::{CredentialStore, FileCredentialStore},
    error::{Error, Result},
    lifecycle::{SessionEnd, SessionSupervisor, SupervisorConfig},
    process::{
        ManagedSidecar, SidecarConfig, SidecarLauncher, SidecarProcess, find_sidecar_dir,
        start_sidecar,
    },
    router::EventRouter,
    sidecar::{DEFAULT_SIDECAR_PORT, SidecarConnector},
    transport::{Session, Transport, TransportConnector, TransportError},
    types::{DisconnectReason, InboundEvent},
};
