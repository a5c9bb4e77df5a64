//! Error taxonomy for the hub protocol client.
//!
//! Transport failures are fatal to the live connection and are recovered by
//! the supervisor. Protocol and authentication failures abort a connect
//! attempt. Deserialization failures on a healthy socket are handled locally
//! by the read pump and only reach callers when they concern their own reply.

/// Errors that can occur while talking to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HassError {
    /// Socket-level failure (I/O error, abrupt remote close, connect failure).
    Transport(String),
    /// Peer closed the WebSocket.
    ConnectionClosed {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// Unexpected message during the handshake or a malformed sequence.
    Protocol(String),
    /// The hub rejected the access token.
    AuthInvalid(String),
    /// A message body could not be decoded into the expected shape.
    Deserialization(String),
    /// No reply arrived within the operation's bound.
    Timeout,
    /// The connection's disconnect signal fired while waiting.
    Cancelled,
    /// No live connection.
    NotConnected,
    /// `connect` was called while a socket is still open.
    AlreadyConnected,
    /// The hub answered `success: false`.
    CommandFailed {
        /// Hub error code (e.g. `not_found`).
        code: String,
        /// Human-readable error message.
        message: String,
    },
    /// REST API request failed.
    Http(String),
}

impl HassError {
    /// Returns `true` for outcomes that mean "stop waiting": the operation was
    /// cut short by a timeout, a close or a transport failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Cancelled | Self::ConnectionClosed { .. }
        )
    }
}

impl std::fmt::Display for HassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::ConnectionClosed { code, reason } => {
                write!(f, "Connection closed by hub (code {code}): {reason}")
            }
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::AuthInvalid(msg) => write!(f, "Authentication rejected: {msg}"),
            Self::Deserialization(msg) => write!(f, "Deserialization error: {msg}"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::AlreadyConnected => write!(f, "Already connected"),
            Self::CommandFailed { code, message } => {
                write!(f, "Command failed ({code}): {message}")
            }
            Self::Http(msg) => write!(f, "HTTP error: {msg}"),
        }
    }
}

impl std::error::Error for HassError {}

impl From<serde_json::Error> for HassError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

impl From<reqwest::Error> for HassError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_grouping() {
        assert!(HassError::Timeout.is_cancellation());
        assert!(HassError::Cancelled.is_cancellation());
        assert!(HassError::ConnectionClosed {
            code: 1000,
            reason: String::new()
        }
        .is_cancellation());
        assert!(!HassError::AuthInvalid("bad".into()).is_cancellation());
        assert!(!HassError::Protocol("x".into()).is_cancellation());
    }

    #[test]
    fn test_display_command_failed() {
        let e = HassError::CommandFailed {
            code: "not_found".into(),
            message: "Service not found".into(),
        };
        assert_eq!(e.to_string(), "Command failed (not_found): Service not found");
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        assert!(matches!(HassError::from(err), HassError::Deserialization(_)));
    }
}
