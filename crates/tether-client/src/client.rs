//! Daemon client implementation

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{op, BufferEdit, BufferId, Hello, OutboundMessage, ProtocolError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bootstrap::{establish_session, SessionCookies};
use crate::config::{ClientConfig, ErrorPolicy};
use crate::error::ClientError;
use crate::session::{ConnectionState, Flow, PendingReply, Session};
use crate::subscription::{BufferCallback, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Handle to one daemon connection.
///
/// Cheap to clone; clones share the session. The connection is closed when
/// the last clone is dropped.
#[derive(Clone)]
pub struct DaemonClient {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<Session>,
    writer: Arc<Mutex<WsSink>>,
    config: ClientConfig,
    socket_url: Url,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl DaemonClient {
    /// Connect to the daemon serving `config.url` and greet it.
    ///
    /// Steps:
    /// 1. Derive the socket URL from the page URL
    /// 2. Optionally fetch `/session` and carry its cookies into the upgrade
    /// 3. Open the WebSocket and start dispatching inbound frames
    /// 4. Send `hello` (and wait for its ack if configured)
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let page = Url::parse(&config.url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        let socket_url = tether_protocol::socket_url(&page)?;

        let cookies = if config.handshake.establish_session {
            let endpoint = match &config.handshake.session_url {
                Some(url) => Url::parse(url)
                    .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?,
                None => tether_protocol::session_url(&page)?,
            };
            establish_session(&endpoint, config.request_timeout()).await?
        } else {
            SessionCookies::default()
        };

        let mut request = socket_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", socket_url, e)))?;
        if let Some(cookie) = cookies.header_value() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| ClientError::Session(format!("unusable session cookie: {}", e)))?;
            request.headers_mut().insert(COOKIE, value);
        }

        info!(url = %socket_url, "Connecting to daemon");
        let session = Arc::new(Session::new(config.errors.protocol));
        let (stream, _response) = match upgrade(request, config.request_timeout()).await {
            Ok(upgraded) => upgraded,
            Err(reason) => {
                session.terminate(
                    ConnectionState::Errored(reason.clone()),
                    ClientError::Connection(reason.clone()),
                );
                return Err(ClientError::Connection(reason));
            }
        };

        let (sink, stream) = stream.split();
        let writer = Arc::new(Mutex::new(sink));
        session.mark_open();
        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&session),
            Arc::clone(&writer),
        ));
        info!(url = %socket_url, "Connected to daemon");

        let client = Self {
            inner: Arc::new(Inner {
                session,
                writer,
                config,
                socket_url,
                reader,
            }),
        };
        client.greet().await?;
        Ok(client)
    }

    async fn greet(&self) -> Result<(), ClientError> {
        let handshake = &self.inner.config.handshake;
        let hello = Hello {
            version: handshake.protocol_version.clone(),
        };
        let data = serde_json::to_value(&hello).map_err(|e| ClientError::Encode(e.to_string()))?;
        let pending = self.transmit(op::HELLO, data).await?;

        if handshake.await_hello_ack {
            let ack = self
                .await_reply(op::HELLO, pending, self.inner.config.request_timeout())
                .await?;
            debug!(?ack, "Daemon acknowledged hello");
        }
        Ok(())
    }

    /// WebSocket URL derived from the configured page URL.
    pub fn socket_url(&self) -> &Url {
        &self.inner.socket_url
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.state_changes()
    }

    /// Number of requests still waiting for an ack.
    pub fn pending_requests(&self) -> usize {
        self.inner.session.pending_count()
    }

    /// Send a request and wait for the matching `ack`, using the configured deadline.
    pub async fn send(&self, op: &str, data: Value) -> Result<Value, ClientError> {
        self.send_with_timeout(op, data, self.inner.config.request_timeout())
            .await
    }

    /// Send a request with an explicit deadline (`None` waits forever).
    ///
    /// Dropping the returned future cancels the request.
    pub async fn send_with_timeout(
        &self,
        op: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let pending = self.transmit(op, data).await?;
        self.await_reply(op, pending, timeout).await
    }

    /// Typed variant of `send`.
    pub async fn request<P, R>(&self, op: &str, payload: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload).map_err(|e| ClientError::Encode(e.to_string()))?;
        let ack = self.send(op, data).await?;
        serde_json::from_value(ack).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Write one request. The `seq-id` is allocated while the writer is held,
    /// so ids reach the daemon in increasing order.
    async fn transmit(&self, op: &str, data: Value) -> Result<PendingReply, ClientError> {
        let mut writer = self.inner.writer.lock().await;
        let pending = self.inner.session.register()?;
        let message = OutboundMessage::new(op, data, pending.seq_id());
        let text = message
            .to_json()
            .map_err(|e| ClientError::Encode(e.to_string()))?;

        debug!(seq_id = message.seq_id, op, "Sending request");
        if let Err(e) = writer.send(Message::text(text)).await {
            drop(writer);
            let reason = e.to_string();
            error!(seq_id = message.seq_id, op, error = %reason, "Failed to write to daemon");
            self.inner.session.terminate(
                ConnectionState::Errored(reason.clone()),
                ClientError::Connection(reason.clone()),
            );
            return Err(ClientError::Connection(reason));
        }
        Ok(pending)
    }

    async fn await_reply(
        &self,
        op: &str,
        pending: PendingReply,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let seq_id = pending.seq_id();
        let Some(limit) = timeout else {
            return pending.await;
        };

        match tokio::time::timeout(limit, pending).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(seq_id, op, timeout = ?limit, "Request timed out");
                if self.inner.config.errors.timeout == ErrorPolicy::Fatal {
                    self.fail(format!("request `{}` (seq-id {}) timed out", op, seq_id))
                        .await;
                }
                Err(ClientError::RequestTimeout {
                    op: op.to_string(),
                    seq_id,
                    timeout: limit,
                })
            }
        }
    }

    /// Call `callback(op, data)` for every edit pushed for `buffer`.
    ///
    /// Callbacks run on the connection's reader task, in registration order,
    /// and should not block. Once the session has ended the callback is
    /// dropped right away and never called.
    pub fn on_buffer<F>(&self, buffer: impl Into<BufferId>, callback: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let buffer = buffer.into();
        let registry = self.inner.session.buffers();
        let callback: BufferCallback = Arc::new(callback);
        let id = registry.subscribe(buffer.clone(), callback);
        Subscription::new(id, buffer, registry)
    }

    /// Channel form of `on_buffer`.
    ///
    /// The receiver ends when the subscription is removed or the session ends,
    /// including when the session had already ended before this call.
    pub fn buffer_events(
        &self,
        buffer: impl Into<BufferId>,
    ) -> (Subscription, mpsc::UnboundedReceiver<BufferEdit>) {
        let buffer = buffer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = buffer.clone();
        let subscription = self.on_buffer(buffer, move |op: &str, data: &Value| {
            // Ignore send errors (receiver may have been dropped)
            let _ = tx.send(BufferEdit {
                id: id.clone(),
                op: op.to_string(),
                data: data.clone(),
            });
        });
        (subscription, rx)
    }

    /// Close the connection.
    ///
    /// Pending requests fail with `Closed` and subscriptions are dropped.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        send_close(&self.inner.writer).await;
        self.inner
            .session
            .terminate(ConnectionState::Closed, ClientError::Closed);
    }

    async fn fail(&self, reason: String) {
        send_close(&self.inner.writer).await;
        self.inner.session.terminate(
            ConnectionState::Errored(reason.clone()),
            ClientError::Connection(reason),
        );
    }
}

/// Run the WebSocket upgrade, bounded by `deadline` when one is set.
async fn upgrade(
    request: Request,
    deadline: Option<Duration>,
) -> Result<(WsStream, Response), String> {
    let handshake = connect_async(request);
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_) => return Err(format!("websocket handshake timed out after {:?}", limit)),
        },
        None => handshake.await,
    };
    result.map_err(|e| e.to_string())
}

async fn send_close(writer: &Mutex<WsSink>) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.send(Message::Close(None)).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

/// Dispatch inbound frames until the connection ends.
///
/// Frames are handled one at a time, so acks and buffer edits are processed
/// in the order the daemon sent them.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    session: Arc<Session>,
    writer: Arc<Mutex<WsSink>>,
) {
    while let Some(frame) = stream.next().await {
        let flow = match frame {
            Ok(Message::Text(text)) => session.receive(text.as_str()),
            Ok(Message::Binary(_)) => session.reject(ProtocolError::UnsupportedFrame("binary")),
            Ok(Message::Close(frame)) => {
                info!(?frame, "Daemon closed the connection");
                session.terminate(ConnectionState::Closed, ClientError::Closed);
                return;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Flow::Continue,
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "Daemon connection failed");
                session.terminate(
                    ConnectionState::Errored(reason.clone()),
                    ClientError::Connection(reason),
                );
                return;
            }
        };

        if let Flow::Terminate(err) = flow {
            debug!(error = %err, "Closing connection after protocol error");
            send_close(&writer).await;
            return;
        }
    }

    info!("Daemon connection ended");
    session.terminate(ConnectionState::Closed, ClientError::Closed);
}
