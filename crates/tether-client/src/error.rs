//! Client error types

use std::time::Duration;
use tether_protocol::{EndpointError, ProtocolError, SeqId};

/// Errors surfaced by the daemon client.
///
/// `Clone` so a single connection failure can be delivered to every
/// in-flight request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("invalid daemon url: {0}")]
    InvalidUrl(String),

    #[error("session bootstrap failed: {0}")]
    Session(String),

    #[error("daemon connection error: {0}")]
    Connection(String),

    #[error("daemon connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request `{op}` (seq-id {seq_id}) timed out after {timeout:?}")]
    RequestTimeout {
        op: String,
        seq_id: SeqId,
        timeout: Duration,
    },

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<EndpointError> for ClientError {
    fn from(e: EndpointError) -> Self {
        ClientError::InvalidUrl(e.to_string())
    }
}

impl ClientError {
    /// True when the session this error came from can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_request() {
        let err = ClientError::RequestTimeout {
            op: "save".into(),
            seq_id: 3,
            timeout: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("save"));
        assert!(msg.contains("seq-id 3"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_connection_lost() {
        assert!(ClientError::Closed.is_connection_lost());
        assert!(ClientError::Connection("reset".into()).is_connection_lost());
        assert!(!ClientError::Protocol(ProtocolError::MissingSeqId).is_connection_lost());
    }
}
