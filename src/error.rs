//! Error taxonomy for the messaging runtime.
//!
//! Transport and persistence failures are recovered locally (reconnect loop,
//! failed-state surfaced to the caller); protocol failures are logged and
//! dropped. Nothing in this crate propagates as an unhandled fault.

use thiserror::Error;

/// Connect/send/receive failure on the duplex channel.
///
/// Always routed to the reconnect path by the connection manager.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection attempt failed: {0}")]
    Connect(String),
}

/// Malformed payload from the server. Logged and dropped; the timeline is
/// never affected by one of these.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed event payload: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    #[error("Event carries no message body")]
    MissingMessage,
}

/// Local-store open/transaction failure, surfaced to the caller as a failed
/// save or load. Locally stored data is best-effort and never the sole record
/// of anything already server-confirmed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Entropy source failure: {0}")]
    Entropy(#[from] getrandom::Error),

    #[error("Store task cancelled")]
    TaskCancelled,
}

/// Opaque failure reported by one of the surrounding application's network
/// collaborators (history fetch, send, upload, directory fetch).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RemoteError(pub String);

/// Crate-level umbrella error.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Collaborator call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("No timeline entry for message key {0}")]
    UnknownMessage(String),

    #[error("Image bytes for {0} are no longer held; compose the send again")]
    UploadUnavailable(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
