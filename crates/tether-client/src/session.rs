//! Per-connection session state
//!
//! A `Session` owns everything that lives for exactly one daemon connection:
//! the `seq-id` counter, the table of requests waiting for their `ack`, the
//! buffer subscriptions and the connection state. It does no I/O itself;
//! the client feeds it inbound text frames and asks it for sequence ids.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_protocol::{BufferId, Inbound, ProtocolError, SeqId};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::ErrorPolicy;
use crate::error::ClientError;
use crate::subscription::BufferRegistry;

type Reply = Result<Value, ClientError>;

/// Connection lifecycle: `Connecting -> Open -> (Closed | Errored)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored(String),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// `Closed` or `Errored`: the session will not carry traffic again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Errored(reason) => write!(f, "errored: {}", reason),
        }
    }
}

/// What a successfully decoded frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Ack matched a pending request
    Resolved(SeqId),
    /// Ack for an id nobody is waiting on
    Unmatched(SeqId),
    /// Push delivered to this many subscribers
    Delivered { buffer: BufferId, subscribers: usize },
}

/// Whether the reader should keep going after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate(ProtocolError),
}

/// State of one daemon connection, shared by the client handle and the
/// reader task.
pub struct Session {
    next_seq: AtomicU64,
    pending: Mutex<HashMap<SeqId, oneshot::Sender<Reply>>>,
    buffers: Arc<BufferRegistry>,
    state: watch::Sender<ConnectionState>,
    protocol_policy: ErrorPolicy,
}

impl Session {
    /// Fresh session in `Connecting`, with `seq-id`s starting at 0.
    pub fn new(protocol_policy: ErrorPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            buffers: Arc::new(BufferRegistry::new()),
            state,
            protocol_policy,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Buffer subscriptions of this session.
    pub fn buffers(&self) -> &Arc<BufferRegistry> {
        &self.buffers
    }

    /// Number of requests still waiting for their ack.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// `Connecting -> Open`. No effect in any other state.
    pub fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Allocate the next `seq-id` and register a reply slot for it.
    ///
    /// Fails with `Closed` once the session has ended.
    pub fn register(self: &Arc<Self>) -> Result<PendingReply, ClientError> {
        let (tx, rx) = oneshot::channel();
        let seq_id = {
            let mut pending = self.pending.lock();
            // Checked under the pending lock so `terminate` cannot drain
            // between the check and the insert.
            if self.state.borrow().is_terminal() {
                return Err(ClientError::Closed);
            }
            let seq_id = self.next_seq.fetch_add(1, Ordering::SeqCst);
            pending.insert(seq_id, tx);
            seq_id
        };
        trace!(seq_id, "Registered pending request");

        Ok(PendingReply {
            seq_id,
            rx,
            session: Arc::clone(self),
        })
    }

    fn forget(&self, seq_id: SeqId) {
        if self.pending.lock().remove(&seq_id).is_some() {
            debug!(seq_id, "Dropped pending request");
        }
    }

    /// Decode and dispatch one text frame.
    pub fn handle_text(&self, text: &str) -> Result<Dispatched, ProtocolError> {
        match Inbound::parse(text)? {
            Inbound::Ack { seq_id, data } => {
                let waiter = self.pending.lock().remove(&seq_id);
                match waiter {
                    Some(tx) => {
                        trace!(seq_id, "Resolving request");
                        // Receiver may have been dropped after the lookup
                        let _ = tx.send(Ok(data));
                        Ok(Dispatched::Resolved(seq_id))
                    }
                    None => {
                        debug!(seq_id, "Ignoring ack without pending request");
                        Ok(Dispatched::Unmatched(seq_id))
                    }
                }
            }
            Inbound::EditBuffer(edit) => {
                let subscribers = self.buffers.deliver(&edit);
                Ok(Dispatched::Delivered {
                    buffer: edit.id,
                    subscribers,
                })
            }
            Inbound::Unknown { op, .. } => Err(ProtocolError::UnknownOp(op)),
        }
    }

    /// Handle one text frame, applying the protocol error policy.
    pub fn receive(&self, text: &str) -> Flow {
        match self.handle_text(text) {
            Ok(dispatched) => {
                trace!(?dispatched, "Dispatched daemon message");
                Flow::Continue
            }
            Err(err) => self.reject(err),
        }
    }

    /// Apply the protocol error policy to a frame that could not be handled.
    pub fn reject(&self, err: ProtocolError) -> Flow {
        match self.protocol_policy {
            ErrorPolicy::Recover => {
                warn!(error = %err, "Dropping daemon message");
                Flow::Continue
            }
            ErrorPolicy::Fatal => {
                error!(error = %err, "Protocol error, ending session");
                self.terminate(
                    ConnectionState::Errored(err.to_string()),
                    ClientError::Protocol(err.clone()),
                );
                Flow::Terminate(err)
            }
        }
    }

    /// End the session.
    ///
    /// Every pending request is failed with `error` and all buffer
    /// subscriptions are dropped. Only the first call has any effect;
    /// returns whether this call ended the session.
    pub fn terminate(&self, state: ConnectionState, error: ClientError) -> bool {
        debug_assert!(state.is_terminal());
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if !changed {
            return false;
        }

        let drained: Vec<_> = self.pending.lock().drain().collect();
        info!(state = %state, failed_requests = drained.len(), "Daemon session ended");
        for (seq_id, tx) in drained {
            trace!(seq_id, "Failing pending request");
            let _ = tx.send(Err(error.clone()));
        }
        self.buffers.close();
        true
    }
}

/// Reply slot for one in-flight request; resolves with the `ack` data.
///
/// Dropping it before it resolves cancels the request: the entry is
/// removed and a later ack for its `seq-id` is ignored.
#[must_use = "a dropped PendingReply cancels its request"]
pub struct PendingReply {
    seq_id: SeqId,
    rx: oneshot::Receiver<Reply>,
    session: Arc<Session>,
}

impl PendingReply {
    /// `seq-id` the request was sent with.
    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("seq_id", &self.seq_id)
            .finish()
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.session.forget(self.seq_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use tracing_test::traced_test;

    fn open_session(policy: ErrorPolicy) -> Arc<Session> {
        let session = Arc::new(Session::new(policy));
        assert!(session.mark_open());
        session
    }

    #[test]
    fn test_seq_ids_start_at_zero_and_increase() {
        let session = open_session(ErrorPolicy::Recover);
        let replies: Vec<_> = (0..5).map(|_| session.register().unwrap()).collect();
        let ids: Vec<_> = replies.iter().map(|r| r.seq_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(session.pending_count(), 5);
    }

    #[test]
    fn test_seq_ids_not_reused_after_settle() {
        let session = open_session(ErrorPolicy::Recover);
        let first = session.register().unwrap();
        drop(first);
        let second = session.register().unwrap();
        assert_eq!(second.seq_id(), 1);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_request() {
        let session = open_session(ErrorPolicy::Recover);
        let reply = session.register().unwrap();
        assert_eq!(reply.seq_id(), 0);

        let dispatched = session
            .handle_text(r#"{"op":"ack","data":{"status":"ok"},"seq-id":0}"#)
            .unwrap();
        assert_eq!(dispatched, Dispatched::Resolved(0));
        assert_eq!(session.pending_count(), 0);

        assert_eq!(reply.await.unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_ack_resolves_exactly_once() {
        let session = open_session(ErrorPolicy::Recover);
        let reply = session.register().unwrap();

        let ack = r#"{"op":"ack","data":1,"seq-id":0}"#;
        assert_eq!(session.handle_text(ack).unwrap(), Dispatched::Resolved(0));
        assert_eq!(session.handle_text(ack).unwrap(), Dispatched::Unmatched(0));

        assert_eq!(reply.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_acks_resolve_out_of_order() {
        let session = open_session(ErrorPolicy::Recover);
        let first = session.register().unwrap();
        let second = session.register().unwrap();

        session.receive(r#"{"op":"ack","data":"second","seq-id":1}"#);
        session.receive(r#"{"op":"ack","data":"first","seq-id":0}"#);

        assert_eq!(second.await.unwrap(), json!("second"));
        assert_eq!(first.await.unwrap(), json!("first"));
    }

    #[test]
    fn test_unmatched_ack_changes_nothing() {
        let session = open_session(ErrorPolicy::Recover);
        let _reply = session.register().unwrap();

        let dispatched = session
            .handle_text(r#"{"op":"ack","data":null,"seq-id":42}"#)
            .unwrap();
        assert_eq!(dispatched, Dispatched::Unmatched(42));
        assert_eq!(session.pending_count(), 1);
        assert!(session.state().is_open());
    }

    #[test]
    fn test_dropped_reply_removes_entry() {
        let session = open_session(ErrorPolicy::Recover);
        let reply = session.register().unwrap();
        assert_eq!(session.pending_count(), 1);

        drop(reply);
        assert_eq!(session.pending_count(), 0);

        // Late ack for the cancelled request is ignored
        assert_eq!(
            session
                .handle_text(r#"{"op":"ack","data":1,"seq-id":0}"#)
                .unwrap(),
            Dispatched::Unmatched(0)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_json_never_settles_pending() {
        let session = open_session(ErrorPolicy::Recover);
        let mut reply = session.register().unwrap();

        assert_eq!(session.receive("{\"op\":\"ack\",\"seq-id\":0"), Flow::Continue);
        assert_eq!(session.receive("not json at all"), Flow::Continue);

        assert_eq!(session.pending_count(), 1);
        assert!(session.state().is_open());
        assert!(futures_util::poll!(&mut reply).is_pending());
        assert!(logs_contain("Dropping daemon message"));
    }

    #[test]
    fn test_unknown_op_is_protocol_error() {
        let session = open_session(ErrorPolicy::Recover);
        let err = session
            .handle_text(r#"{"op":"reload","data":{}}"#)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOp("reload".into()));
        assert_eq!(session.receive(r#"{"op":"reload"}"#), Flow::Continue);
    }

    #[test]
    fn test_edit_buffer_reaches_subscriber() {
        let session = open_session(ErrorPolicy::Recover);
        let calls = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        session.buffers().subscribe(
            "buf1".into(),
            Arc::new(move |op: &str, data: &Value| {
                sink.lock().push((op.to_string(), data.clone()));
            }),
        );

        let dispatched = session
            .handle_text(r#"{"op":"edit-buffer","data":{"id":"buf1","op":"insert","data":"x"}}"#)
            .unwrap();

        assert_eq!(
            dispatched,
            Dispatched::Delivered {
                buffer: "buf1".into(),
                subscribers: 1
            }
        );
        assert_eq!(*calls.lock(), vec![("insert".to_string(), json!("x"))]);
    }

    #[test]
    fn test_edit_buffer_without_subscribers() {
        let session = open_session(ErrorPolicy::Recover);
        let dispatched = session
            .handle_text(r#"{"op":"edit-buffer","data":{"id":"nobody","op":"insert","data":1}}"#)
            .unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Delivered {
                buffer: "nobody".into(),
                subscribers: 0
            }
        );
    }

    #[tokio::test]
    async fn test_fatal_policy_terminates_session() {
        let session = open_session(ErrorPolicy::Fatal);
        let reply = session.register().unwrap();

        let flow = session.receive("{broken");
        assert!(matches!(flow, Flow::Terminate(ProtocolError::Malformed(_))));
        assert!(matches!(session.state(), ConnectionState::Errored(_)));

        let err = reply.await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_terminate_fails_pending_and_clears_buffers() {
        let session = open_session(ErrorPolicy::Recover);
        let first = session.register().unwrap();
        let second = session.register().unwrap();
        session
            .buffers()
            .subscribe("buf".into(), Arc::new(|_: &str, _: &Value| {}));

        assert!(session.terminate(ConnectionState::Closed, ClientError::Closed));

        assert!(matches!(first.await, Err(ClientError::Closed)));
        assert!(matches!(second.await, Err(ClientError::Closed)));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.buffers().buffer_count(), 0);
        assert!(session.buffers().is_closed());
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let session = open_session(ErrorPolicy::Recover);
        assert!(session.terminate(
            ConnectionState::Errored("reset".into()),
            ClientError::Connection("reset".into())
        ));
        assert!(!session.terminate(ConnectionState::Closed, ClientError::Closed));
        assert_eq!(session.state(), ConnectionState::Errored("reset".into()));
    }

    #[test]
    fn test_register_after_terminate() {
        let session = open_session(ErrorPolicy::Recover);
        session.terminate(ConnectionState::Closed, ClientError::Closed);
        assert!(matches!(session.register(), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_state_changes_observable() {
        let session = Arc::new(Session::new(ErrorPolicy::Recover));
        let mut changes = session.state_changes();
        assert_eq!(*changes.borrow(), ConnectionState::Connecting);

        session.mark_open();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Open);

        session.terminate(ConnectionState::Closed, ClientError::Closed);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Closed);

        // Terminal states do not reopen
        assert!(!session.mark_open());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(
            ConnectionState::Errored("reset".into()).to_string(),
            "errored: reset"
        );
    }
}
