//! # Error Handling
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         ERROR HIERARCHY                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  Error (top-level)                                               │
//! │  │                                                                │
//! │  ├── TransportClosed    - data/control stream closed unexpectedly│
//! │  ├── MalformedFrame     - short header, bad JSON, unknown type   │
//! │  ├── Storage            - spill read/write failure               │
//! │  ├── ProtocolTimeout    - a rendezvous exceeded its deadline      │
//! │  ├── SignalingFailure   - handshake failed before `connected`     │
//! │  ├── Io                 - filesystem / chunk-reader failure       │
//! │  └── Serialization      - control-envelope codec failure          │
//! │                                                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine never lets an `Error` escape `Sender::send_files` or the
//! coordinator's message dispatch as a panic or unhandled result. Every
//! variant here is either logged and absorbed (malformed frame, storage
//! failure on one file) or turned into a state transition (transport
//! closed, signaling failure). See [`Error::is_recoverable`].

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The data or control stream closed unexpectedly. All pending
    /// rendezvous fail and the batch aborts.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Header too short, JSON parse failure, or (when not silently
    /// ignored) an unrecognized control message shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Spill-tier read/write failure. The current file is marked failed;
    /// the batch continues.
    #[error("storage error: {0}")]
    Storage(String),

    /// A control rendezvous (`accept-batch`, `ready-for-file`, `ack-file`)
    /// did not resolve within its deadline.
    #[error("protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// Signaling or peer-connection setup failed before reaching
    /// `Connected`.
    #[error("signaling failure: {0}")]
    SignalingFailure(String),

    /// Underlying filesystem error (chunk reads on the sender side,
    /// spill-file cleanup on the receiver side).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Control envelope failed to encode or decode as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable numeric code, grouped by category, for host applications that
    /// want to match on something other than the `Debug` variant name.
    pub fn code(&self) -> i32 {
        match self {
            Error::TransportClosed(_) => 100,
            Error::MalformedFrame(_) => 200,
            Error::Storage(_) => 300,
            Error::ProtocolTimeout(_) => 400,
            Error::SignalingFailure(_) => 500,
            Error::Io(_) => 600,
            Error::Serialization(_) => 700,
        }
    }

    /// Whether the engine can continue the current batch after this error,
    /// as opposed to requiring the whole session to be torn down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::Storage(_) | Error::ProtocolTimeout(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
