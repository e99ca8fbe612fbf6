//! In-process mock daemon for integration tests
//!
//! Accepts a single WebSocket connection, records the upgrade request, hands
//! every text frame it receives to the test as JSON, and sends whatever the
//! test pushes.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::Inbound;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// What the client sent in its upgrade request.
#[derive(Debug, Clone, Default)]
pub struct Upgrade {
    pub path: String,
    pub cookie: Option<String>,
}

pub struct MockDaemon {
    addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Message>,
    upgrade: Arc<Mutex<Option<Upgrade>>>,
    task: JoinHandle<()>,
}

impl MockDaemon {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock daemon");
        let addr = listener.local_addr().expect("No local addr");

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let upgrade = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&upgrade);

        let task = tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };

            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let cookie = req
                    .headers()
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                *seen.lock().unwrap() = Some(Upgrade {
                    path: req.uri().path().to_string(),
                    cookie,
                });
                Ok(resp)
            };
            let Ok(ws) = accept_hdr_async(tcp, callback).await else {
                return;
            };
            let (mut sink, mut stream) = ws.split();

            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let value: Value = match serde_json::from_str(text.as_str()) {
                                Ok(v) => v,
                                Err(_) => Value::String(text.as_str().to_string()),
                            };
                            if inbound_tx.send(value).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    out = outbound_rx.recv() => match out {
                        Some(msg) => {
                            let closing = matches!(msg, Message::Close(_));
                            if sink.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            addr,
            inbound,
            outbound,
            upgrade,
            task,
        }
    }

    /// Page URL whose derived socket points at this daemon.
    pub fn page_url(&self) -> String {
        format!("http://{}/app/", self.addr)
    }

    pub fn upgrade(&self) -> Option<Upgrade> {
        self.upgrade.lock().unwrap().clone()
    }

    /// Next frame from the client, as JSON.
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("Timed out waiting for client frame")
            .expect("Mock daemon connection ended")
    }

    /// Receive and check the `hello` every connection starts with.
    pub async fn expect_hello(&mut self) -> Value {
        let hello = self.recv().await;
        assert_eq!(hello["op"], "hello");
        hello
    }

    pub fn push(&self, msg: &Inbound) {
        let text = msg.to_json().expect("Failed to encode push");
        self.push_raw(&text);
    }

    pub fn push_raw(&self, text: &str) {
        self.outbound
            .send(Message::text(text.to_string()))
            .expect("Mock daemon task ended");
    }

    pub fn push_binary(&self, bytes: Vec<u8>) {
        self.outbound
            .send(Message::binary(bytes))
            .expect("Mock daemon task ended");
    }

    /// Close with a proper close handshake.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    /// Drop the TCP connection without a close frame.
    pub async fn reset(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Wait until `check` holds, polling briefly.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}
