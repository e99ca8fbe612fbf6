mod endpoint;
mod protocol;

pub use endpoint::{session_url, socket_url, EndpointError, SESSION_PATH, SOCKET_SEGMENT};
pub use protocol::{
    op, BufferEdit, BufferId, Hello, Inbound, OutboundMessage, ProtocolError, SeqId,
    PROTOCOL_VERSION,
};
