//! Outbound webhook delivery for relayed links.
//!
//! One POST per link, no retries. Every call yields a [`DeliveryOutcome`]
//! and never an error, so a failing destination cannot disturb the caller.

pub mod dispatcher;
pub mod payload;

pub use {
    dispatcher::{DeliveryOutcome, Error, LinkDispatcher, WebhookDispatcher},
    payload::LinkRelayPayload,
};
