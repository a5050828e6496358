//! Error types for the platter client.
//!
//! The taxonomy mirrors the failure surface of the protocol layer:
//! connection failures, server-reported command failures (including
//! synthetic timeouts), and invalid arguments such as unknown event names.
//! Handler faults are deliberately absent; they are caught and logged
//! inside the dispatch path and never surface as values.

/// Errors surfaced by the client to its callers.
#[derive(Debug)]
pub enum ClientError {
    /// No live connection, or the connection failed while the request was
    /// in flight (handshake failure, socket closed, driver gone).
    Connection(String),
    /// The server reported a command failure, or the request timed out
    /// waiting for a response.
    Remote {
        /// The API command that failed.
        command: String,
        /// The server-reported error text (or "request timed out").
        message: String,
    },
    /// Invalid configuration or an unknown event name.
    Argument(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "Connection error: {msg}"),
            Self::Remote { command, message } => {
                write!(f, "Command \"{command}\" failed with message: \"{message}\"")
            }
            Self::Argument(msg) => write!(f, "Invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// True if this is a connection-level failure (useful for reconnect
    /// decisions).
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_includes_command_and_message() {
        let err = ClientError::Remote {
            command: "room.register".to_string(),
            message: "invalid room".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command \"room.register\" failed with message: \"invalid room\""
        );
    }

    #[test]
    fn test_is_connection() {
        assert!(ClientError::Connection("closed".into()).is_connection());
        assert!(!ClientError::Argument("bad".into()).is_connection());
    }
}
