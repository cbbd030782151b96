//! Error types.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::rdma::WcStatus;
use crate::transfer::{ConnectionState, SessionId};

/// Errors reported by connections and the transfer engine.
///
/// Setup-phase failures are returned at the call site. Failures of posted
/// reads are delivered through the [`ReadHandle`](crate::transfer::ReadHandle)
/// of the operation instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested device or port does not exist, or its link layer does
    /// not match the requested one.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Opening or querying a device failed.
    #[error("device error")]
    Device(#[source] io::Error),

    /// The device refused to register a memory region.
    #[error("cannot register memory region `{key}`")]
    RegistrationFailure {
        key: String,
        #[source]
        source: io::Error,
    },

    /// A local memory region with this key is already registered.
    #[error("memory region `{0}` already registered")]
    DuplicateKey(String),

    /// No memory region with this key is registered.
    #[error("memory region `{0}` not registered")]
    UnknownKey(String),

    /// The operation is not allowed in the current connection state.
    #[error("cannot {op} in state {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// Reads require a connected connection.
    #[error("connection is not connected")]
    NotConnected,

    /// The assignment is malformed or does not fit its region.
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),

    /// Driving the queue pair to ready-to-send was rejected.
    #[error("handshake failed")]
    HandshakeFailure(#[source] io::Error),

    /// The device refused the posted work requests.
    #[error("failed to post work requests")]
    PostFailure(#[source] io::Error),

    /// The hardware reported a failed completion.
    #[error("completion error: {0} ({code})", code = .0.code())]
    CompletionError(WcStatus),

    /// The operation was abandoned because the connection was torn down.
    #[error("connection torn down before completion")]
    Disconnected,

    /// A session with this id is already present.
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),

    /// No session with this id is present.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Configuration is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the hardware completion status, if this is a completion error.
    #[inline]
    pub fn completion_status(&self) -> Option<WcStatus> {
        match self {
            Error::CompletionError(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
