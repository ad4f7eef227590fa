//! Wire layer of the Matrix v1 client.
//!
//! Owns the HTTP/JSON transport seam, authentication flows, the
//! `MatrixClient` with its user and room registries, per-room operations
//! including backward pagination, and the long-poll event pump.

/// Authentication flow discovery and staged execution.
pub mod auth;
/// The Matrix client: session, registries, lifecycle, operations.
pub mod client;
/// Environment-backed runtime configuration.
pub mod config;
/// The `initialSync` + `/events` long-poll pump.
pub mod pump;
/// Per-room handle: state queries, wire operations, pagination.
pub mod room;
/// HTTP/JSON transport contract and `reqwest` implementation.
pub mod transport;

pub use auth::Credentials;
pub use client::MatrixClient;
pub use config::{ClientConfig, ConfigError};
pub use pump::SyncHandle;
pub use room::{MessageType, Room};
pub use transport::{HttpTransport, Transport, encode_segment};
