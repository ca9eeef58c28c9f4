#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Carry-Integration
//! Low-level WebSocket integration layer used by the Carry trading ecosystem for public
//! market-data collection.
//!
//! ## Core abstractions:
//! - **WebSocket utilities** for establishing connections and processing frames.
//! - **VenueSocket supervisor** providing per-venue heartbeat, exponential-backoff reconnect
//!   and subscription replay.
//! - **Channel utilities** abstracting over transmitter kinds.

use crate::error::SocketError;

/// All [`Error`](std::error::Error)s generated in Carry-Integration.
pub mod error;

/// Defines a trait [`Tx`](channel::Tx) abstraction over different channel kinds, as well as
/// other channel utilities.
pub mod channel;

/// Low-level [`WebSocket`](websocket::WebSocket) type aliases and frame processing helpers.
pub mod websocket;

/// Per-venue [`VenueSocket`](supervisor::VenueSocket) supervisor: connection state machine,
/// heartbeat schedule, exponential-backoff reconnect and subscription replay.
pub mod supervisor;

/// Defines a [`SubscriptionId`](subscription::SubscriptionId) new type representing a unique
/// `SmolStr` identifier for a subscribed data stream.
pub mod subscription;

/// Utilities to assist deserialisation of venue messages.
pub mod de;

/// [`Validator`]s are capable of determining if their internal state is satisfactory to fulfill
/// some use case defined by the implementor.
pub trait Validator {
    /// Check if `Self` is valid for some use case.
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized;
}

/// Trait that communicates if something is terminal (eg/ requires shutdown or restart).
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}
