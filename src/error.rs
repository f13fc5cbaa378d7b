//! Error taxonomy shared by the registry, the auth layer and the dispatcher.
//!
//! Terminal-level errors are always local and recoverable: the dispatcher
//! turns them into an `error` message for the requesting connection. Handshake
//! errors close the connection with a distinguishable close code.

use std::time::Duration;

use thiserror::Error;

/// Errors from terminal and multiplexer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminalError {
    /// tmux (or the subsystem hosting it) is not installed or disappeared.
    #[error("tmux is not available on this host")]
    NotAvailable,

    /// The referenced terminal id is unknown for this visitor.
    #[error("terminal {0} not found")]
    NotFound(String),

    /// The referenced tmux session does not exist.
    #[error("tmux session {0} not found")]
    SessionNotFound(String),

    /// Session or terminal name is empty, too long, or (for tmux) contains
    /// characters tmux would interpret as a target.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The terminal's input queue is full; the data was dropped.
    #[error("terminal {0} is not accepting input")]
    InputBackedUp(String),

    /// Per-visitor terminal limit reached.
    #[error("terminal limit reached (max {0})")]
    LimitReached(usize),

    /// PTY allocation or process spawn failed.
    #[error("failed to spawn terminal: {0}")]
    Spawn(String),

    /// A tmux subcommand failed for a reason other than a missing session.
    #[error("tmux command failed: {0}")]
    Multiplexer(String),
}

/// Why a token was not accepted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token already used by another visitor")]
    AlreadyConsumed,
}

/// Reasons a connection is refused during the handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("authentication rejected: {0}")]
    AuthRejected(#[from] AuthError),

    #[error("too many failed attempts, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
}

impl HandshakeError {
    /// WebSocket close code sent to the client.
    ///
    /// - `4001`: rejected credentials, the client must not retry silently
    /// - `4029`: rate limited, the client should wait `retry-after`
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthRejected(_) => 4001,
            Self::RateLimited { .. } => 4029,
        }
    }

    /// Short close reason (close frames are limited to 123 bytes).
    pub fn close_reason(&self) -> String {
        match self {
            Self::AuthRejected(_) => "Invalid token".to_string(),
            Self::RateLimited { retry_after } => {
                format!("Rate limited; retry-after={}", retry_after.as_secs().max(1))
            }
        }
    }
}
