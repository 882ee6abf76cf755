//! Session error taxonomy.
//!
//! Errors are plain values so callers can branch on [`SessionError::kind`]. They are
//! `Clone` because the same failure is delivered to the caller that triggered it and
//! to every subscriber of the connection's event channel.

use std::io;
use std::time::Duration;
use thiserror::Error;
use xmpp_wire::WireError;

use crate::negotiation::NegotiationState;

/// Failure of one negotiation step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    /// TLS could not be established or was required but not offered
    #[error("security negotiation failed: {0}")]
    Security(String),

    /// SASL exchange failed or no mechanism is shared
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Resource binding or legacy session establishment failed
    #[error("resource binding failed: {0}")]
    Bind(String),
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O failure on the transport
    Transport,
    /// Security, authentication or bind failure
    Negotiation,
    /// Malformed stream or out-of-range acknowledgement
    ProtocolViolation,
    /// A bounded wait expired
    Timeout,
    /// Operation needs a connected stream
    NotConnected,
    /// Connection went away while waiting
    ConnectionClosed,
    /// Operation not allowed in the current state
    IllegalState,
    /// Server sent `<stream:error/>`
    Stream,
    /// Request answered with an error stanza
    Stanza,
    /// Configuration rejected
    Config,
}

/// Errors produced by the connection engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// I/O failure on the transport
    #[error("transport error: {message}")]
    Transport {
        /// Underlying I/O error kind
        kind: io::ErrorKind,
        /// Underlying error message
        message: String,
    },

    /// Negotiation step failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationFailure),

    /// Peer broke the protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A bounded wait expired
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Configured bound
        after: Duration,
    },

    /// Operation needs a connected stream
    #[error("not connected")]
    NotConnected,

    /// Connection closed while waiting
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation not allowed in the current state
    #[error("illegal state: {0:?}")]
    IllegalState(NegotiationState),

    /// Server-sent stream error
    #[error("stream error: {condition}")]
    Stream {
        /// Defined condition
        condition: String,
        /// Descriptive text
        text: Option<String>,
    },

    /// Error reply to a request
    #[error("stanza error: {condition}")]
    Stanza {
        /// Defined condition
        condition: String,
        /// Descriptive text
        text: Option<String>,
    },

    /// Configuration rejected before connecting
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Classification for branching
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport { .. } => ErrorKind::Transport,
            SessionError::Negotiation(_) => ErrorKind::Negotiation,
            SessionError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::ConnectionClosed => ErrorKind::ConnectionClosed,
            SessionError::IllegalState(_) => ErrorKind::IllegalState,
            SessionError::Stream { .. } => ErrorKind::Stream,
            SessionError::Stanza { .. } => ErrorKind::Stanza,
            SessionError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether another connection attempt could succeed without caller action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::ConnectionClosed
        )
    }

    /// Timeout helper
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        SessionError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Transport error from a kind and message
    pub fn transport(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        SessionError::Transport {
            kind,
            message: message.into(),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::ProtocolViolation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_retry() {
        let io_err: SessionError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(io_err.kind(), ErrorKind::Transport);
        assert!(io_err.is_retryable());

        let auth: SessionError = NegotiationFailure::Auth("not-authorized".into()).into();
        assert_eq!(auth.kind(), ErrorKind::Negotiation);
        assert!(!auth.is_retryable());
        assert_eq!(auth.to_string(), "authentication failed: not-authorized");

        let wire: SessionError = WireError::StrayText.into();
        assert_eq!(wire.kind(), ErrorKind::ProtocolViolation);
        assert!(!wire.is_retryable());
    }
}
