use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version announced in the `hello` greeting.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Client-generated correlation id carried as `seq-id` on the wire.
pub type SeqId = u64;

/// Operation names with protocol meaning.
pub mod op {
    pub const HELLO: &str = "hello";
    pub const ACK: &str = "ack";
    pub const EDIT_BUFFER: &str = "edit-buffer";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("invalid message envelope: {0}")]
    InvalidEnvelope(String),

    #[error("ack without seq-id")]
    MissingSeqId,

    #[error("invalid edit-buffer payload: {0}")]
    InvalidPush(String),

    #[error("unknown op: {0}")]
    UnknownOp(String),

    #[error("unsupported {0} frame")]
    UnsupportedFrame(&'static str),
}

/// Identifier of a daemon-side buffer.
///
/// The daemon decides whether ids are strings or integers, so both are
/// accepted. `BufferId::from("1")` and `BufferId::from(1)` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BufferId {
    Number(u64),
    String(String),
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferId::Number(n) => write!(f, "{}", n),
            BufferId::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for BufferId {
    fn from(id: &str) -> Self {
        BufferId::String(id.to_string())
    }
}

impl From<String> for BufferId {
    fn from(id: String) -> Self {
        BufferId::String(id)
    }
}

impl From<u64> for BufferId {
    fn from(id: u64) -> Self {
        BufferId::Number(id)
    }
}

/// Payload of the `hello` greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Request sent from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub op: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "seq-id")]
    pub seq_id: SeqId,
}

impl OutboundMessage {
    pub fn new(op: impl Into<String>, data: Value, seq_id: SeqId) -> Self {
        Self {
            op: op.into(),
            data,
            seq_id,
        }
    }

    pub fn hello(hello: &Hello, seq_id: SeqId) -> Self {
        Self::new(
            op::HELLO,
            serde_json::json!({ "version": hello.version }),
            seq_id,
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a client request (daemon side).
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Outer `data` of an `edit-buffer` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEdit {
    pub id: BufferId,
    pub op: String,
    #[serde(default)]
    pub data: Value,
}

/// Message received from the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Acknowledgment of the request sent with `seq_id`.
    Ack { seq_id: SeqId, data: Value },
    /// Edit pushed for a buffer.
    EditBuffer(BufferEdit),
    /// Any op this client does not understand.
    Unknown { op: String, data: Value },
}

#[derive(Deserialize)]
struct RawInbound {
    op: String,
    #[serde(default)]
    data: Value,
    #[serde(rename = "seq-id", default)]
    seq_id: Option<SeqId>,
}

#[derive(Serialize)]
struct RawOutgoing<'a> {
    op: &'a str,
    data: Value,
    #[serde(rename = "seq-id", skip_serializing_if = "Option::is_none")]
    seq_id: Option<SeqId>,
}

impl Inbound {
    /// Decode one text frame.
    ///
    /// Invalid JSON and envelopes without a string `op` are distinguished so
    /// callers can log what actually went wrong.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let raw: RawInbound = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;

        match raw.op.as_str() {
            op::ACK => {
                let seq_id = raw.seq_id.ok_or(ProtocolError::MissingSeqId)?;
                Ok(Inbound::Ack {
                    seq_id,
                    data: raw.data,
                })
            }
            op::EDIT_BUFFER => {
                let edit: BufferEdit = serde_json::from_value(raw.data)
                    .map_err(|e| ProtocolError::InvalidPush(e.to_string()))?;
                Ok(Inbound::EditBuffer(edit))
            }
            _ => Ok(Inbound::Unknown {
                op: raw.op,
                data: raw.data,
            }),
        }
    }

    pub fn ack(seq_id: SeqId, data: Value) -> Self {
        Inbound::Ack { seq_id, data }
    }

    pub fn edit_buffer(id: impl Into<BufferId>, op: impl Into<String>, data: Value) -> Self {
        Inbound::EditBuffer(BufferEdit {
            id: id.into(),
            op: op.into(),
            data,
        })
    }

    pub fn op(&self) -> &str {
        match self {
            Inbound::Ack { .. } => op::ACK,
            Inbound::EditBuffer(_) => op::EDIT_BUFFER,
            Inbound::Unknown { op, .. } => op,
        }
    }

    /// Encode as the daemon would send it.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let raw = match self {
            Inbound::Ack { seq_id, data } => RawOutgoing {
                op: op::ACK,
                data: data.clone(),
                seq_id: Some(*seq_id),
            },
            Inbound::EditBuffer(edit) => RawOutgoing {
                op: op::EDIT_BUFFER,
                data: serde_json::to_value(edit)?,
                seq_id: None,
            },
            Inbound::Unknown { op, data } => RawOutgoing {
                op,
                data: data.clone(),
                seq_id: None,
            },
        };
        serde_json::to_string(&raw)
    }
}
