//! Client library for connecting to the tether daemon
//!
//! A connection is one WebSocket session:
//! - `DaemonClient::connect()` derives the socket URL from the page URL,
//!   optionally bootstraps an HTTP session, and greets the daemon
//! - `send()` correlates each request with its `ack` by `seq-id`
//! - `on_buffer()` fans `edit-buffer` pushes out to per-buffer subscribers
//!
//! `Session` holds the per-connection state and is transport-agnostic, so
//! embedders with their own socket can feed frames to `Session::receive`.

pub mod bootstrap;
mod client;
pub mod config;
mod error;
mod session;
mod subscription;

pub use client::DaemonClient;
pub use config::{ClientConfig, ConfigError, ErrorPolicies, ErrorPolicy, HandshakeConfig};
pub use error::ClientError;
pub use session::{ConnectionState, Dispatched, Flow, PendingReply, Session};
pub use subscription::{BufferCallback, BufferRegistry, Subscription, SubscriptionId};

pub use tether_protocol::{BufferEdit, BufferId, SeqId, PROTOCOL_VERSION};
