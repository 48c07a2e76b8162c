//! Error types for session operations
//!
//! The taxonomy separates four very different situations: bad arguments
//! (rejected synchronously, no side effects), transport failures (fatal to
//! the link, surfaced to the retry loop), protocol-level NACKs (logged by the
//! event handler, never escalated) and application rejections (handled inside
//! dispatch, not errors at all). Only the first two ever reach a caller.

use crate::codec::CodecError;
use crate::transport::TransportError;

/// Error type for the public session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("session is not connected to a broker")]
    NotConnected,

    #[error("session processing loop is already running")]
    AlreadyStarted,

    #[error("failed to spawn the processing thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SessionError {
    /// True when the error means the link to the broker is gone and the
    /// lifecycle loop must drop the connection and reconnect.
    pub fn is_link_failure(&self) -> bool {
        match self {
            SessionError::Transport(_) => true,
            SessionError::Codec(CodecError::Transport(_)) => true,
            SessionError::Codec(CodecError::Link(_)) => true,
            _ => false,
        }
    }

    /// Extract the underlying transport failure, if this is one.
    pub(crate) fn into_transport(self) -> Option<TransportError> {
        match self {
            SessionError::Transport(err) => Some(err),
            SessionError::Codec(CodecError::Transport(err)) => Some(err),
            SessionError::Codec(CodecError::Link(failure)) => Some(failure.source),
            _ => None,
        }
    }
}

/// Outcome of one bounded connect cycle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no connection after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("stop requested")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LinkFailure;

    #[test]
    fn link_failures_are_classified() {
        let fatal = [
            SessionError::Transport(TransportError::Closed),
            SessionError::Codec(CodecError::Transport(TransportError::Closed)),
            SessionError::Codec(CodecError::Link(LinkFailure {
                context: "test",
                source: TransportError::Closed,
            })),
        ];
        for err in fatal {
            assert!(err.is_link_failure(), "expected {err} to be a link failure");
        }

        let benign = [
            SessionError::InvalidArgument("topic"),
            SessionError::NotConnected,
            SessionError::AlreadyStarted,
        ];
        for err in benign {
            assert!(!err.is_link_failure(), "expected {err} to be benign");
        }
    }
}
