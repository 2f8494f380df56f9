use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::Frame;

/// Why a session ended. Carried by [`NetplayError::ConnectionLost`] and
/// [`NetplayEvent::Disconnected`].
///
/// [`NetplayEvent::Disconnected`]: crate::NetplayEvent::Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The peer sent an orderly disconnect command.
    PeerDisconnected,
    /// The reliable command stream hung up or failed.
    StreamClosed,
    /// The local side called `disconnect`.
    LocalRequest,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::StreamClosed => write!(f, "command stream closed"),
            Self::LocalRequest => write!(f, "local disconnect request"),
        }
    }
}

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Every variant except [`NetplayError::InvalidRequest`] terminates the session it came from;
/// callers are expected to fall back to local play (see `into_bridge`) or abort.
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayError {
    /// The simulation bridge could not report a fixed serialized-state size.
    UnsupportedBridge {
        /// Further specifies what the bridge reported.
        info: String,
    },
    /// The bridge failed to serialize or restore a snapshot.
    StateTransfer {
        /// The frame the snapshot belongs to.
        frame: Frame,
        /// Whether saving or loading failed.
        context: String,
    },
    /// The peer's hello did not match ours (protocol magic, implementation magic, content or state size).
    HandshakeRejected {
        /// What did not match.
        reason: String,
    },
    /// The handshake did not complete in time.
    HandshakeTimeout,
    /// The session held more unconfirmed frames than the ring can store.
    CapacityViolation {
        /// Frames in flight.
        in_flight: u32,
        /// Ring capacity.
        capacity: usize,
    },
    /// No confirmed input arrived for longer than the configured stall timeout.
    StallTimeout {
        /// The frame the session was waiting to confirm.
        frame: Frame,
    },
    /// The connection is gone. After this error the session only hands back its bridge.
    ConnectionLost {
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::UnsupportedBridge { info } => {
                write!(f, "Simulation bridge cannot be used for rollback: {}", info)
            }
            NetplayError::StateTransfer { frame, context } => {
                write!(f, "State transfer failed at frame {}: {}", frame, context)
            }
            NetplayError::HandshakeRejected { reason } => {
                write!(f, "Handshake rejected: {}", reason)
            }
            NetplayError::HandshakeTimeout => {
                write!(f, "The handshake with the peer did not complete in time.")
            }
            NetplayError::CapacityViolation {
                in_flight,
                capacity,
            } => {
                write!(
                    f,
                    "{} unconfirmed frames in flight exceed the ring capacity of {}",
                    in_flight, capacity
                )
            }
            NetplayError::StallTimeout { frame } => {
                write!(
                    f,
                    "Stalled waiting for remote input for frame {} past the stall timeout",
                    frame
                )
            }
            NetplayError::ConnectionLost { reason } => {
                write!(f, "Connection lost: {}", reason)
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            NetplayError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::SerializationError {
            context: err.to_string(),
        }
    }
}

impl From<std::io::Error> for NetplayError {
    fn from(err: std::io::Error) -> Self {
        NetplayError::SocketError {
            context: err.to_string(),
        }
    }
}

impl NetplayError {
    /// Returns `true` if the error ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, NetplayError::InvalidRequest { .. })
    }
}
