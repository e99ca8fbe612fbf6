//! `tether watch`: stream buffer edits as JSON lines

use anyhow::{Context, Result};
use serde_json::Value;
use tether_client::{BufferEdit, BufferId, ClientConfig, DaemonClient};
use tokio::sync::mpsc;
use tracing::info;

pub async fn execute(config: ClientConfig, buffers: Vec<String>) -> Result<()> {
    let client = DaemonClient::connect(config)
        .await
        .context("Failed to connect to daemon")?;

    // One channel for every buffer; it closes once the session drops all callbacks
    let (tx, mut rx) = mpsc::unbounded_channel::<BufferEdit>();
    let mut subscriptions = Vec::with_capacity(buffers.len());
    for raw in &buffers {
        let id = parse_buffer_id(raw);
        let tx = tx.clone();
        let buffer = id.clone();
        subscriptions.push(client.on_buffer(id, move |op: &str, data: &Value| {
            let _ = tx.send(BufferEdit {
                id: buffer.clone(),
                op: op.to_string(),
                data: data.clone(),
            });
        }));
    }
    drop(tx);
    info!(buffers = subscriptions.len(), "Watching buffers");

    loop {
        tokio::select! {
            edit = rx.recv() => match edit {
                Some(edit) => println!("{}", serde_json::to_string(&edit)?),
                None => {
                    info!(state = %client.state(), "Daemon session ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    client.close().await;
    Ok(())
}

/// Canonical decimal ids (`0`, `12`, no sign or leading zeros) are numeric
/// buffer ids; anything else is a string id.
pub fn parse_buffer_id(raw: &str) -> BufferId {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<u64>() {
            if n.to_string() == raw {
                return BufferId::Number(n);
            }
        }
    }
    BufferId::String(raw.to_string())
}
