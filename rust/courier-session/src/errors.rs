//! Error types reported to callers of the session layer.

use std::fmt;

use courier_wire::Address;

/// Failure of a requester/provider call. `Ok` is the success status; every
/// other call outcome is a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionError {
    /// The requester is not connected to an available provider.
    ServiceUnavailable,
    /// The link or transport on the way to the peer is gone.
    ReceiverUnavailable,
    /// Caller error: invalid registration id, duplicate handler, or an
    /// argument the operation cannot accept. No state was changed.
    InvalidParam,
    /// A sync call ran out of time. A normal outcome, not a framework error.
    Timeout,
    /// Anything the other variants do not cover.
    FailedUnknown,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::ServiceUnavailable => write!(f, "service unavailable"),
            ActionError::ReceiverUnavailable => write!(f, "receiver unavailable"),
            ActionError::InvalidParam => write!(f, "invalid parameter"),
            ActionError::Timeout => write!(f, "timed out"),
            ActionError::FailedUnknown => write!(f, "failed for an unknown reason"),
        }
    }
}

impl std::error::Error for ActionError {}

/// Result of a requester/provider call.
pub type ActionResult<T> = Result<T, ActionError>;

/// Error reported by a transport to the routers built on top of it.
#[derive(Debug)]
pub enum TransportError {
    /// The transport was shut down.
    Closed,
    /// The destination peer is not connected.
    PeerGone(Address),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::PeerGone(addr) => write!(f, "peer {addr} is gone"),
            TransportError::Io(e) => write!(f, "transport i/o error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}
