//! `tether send`: one request, one printed ack

use anyhow::{Context, Result};
use serde_json::Value;
use tether_client::{ClientConfig, DaemonClient};
use tracing::debug;

pub async fn execute(config: ClientConfig, op: String, data: Option<String>) -> Result<()> {
    // Reject bad payloads before touching the network
    let data = parse_data(data.as_deref())?;

    let client = DaemonClient::connect(config)
        .await
        .context("Failed to connect to daemon")?;

    let result = client.send(&op, data).await;
    client.close().await;

    let ack = result.with_context(|| format!("Request `{}` failed", op))?;
    debug!(op = %op, "Request acknowledged");
    println!("{}", serde_json::to_string_pretty(&ack)?);
    Ok(())
}

/// Parse the optional JSON payload argument. A missing payload is `null`.
pub fn parse_data(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(text) => {
            serde_json::from_str(text).with_context(|| format!("Invalid JSON data: {}", text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_data_is_null() {
        assert_eq!(parse_data(None).unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_object_and_scalar() {
        assert_eq!(
            parse_data(Some(r#"{"path": "a.txt"}"#)).unwrap(),
            json!({"path": "a.txt"})
        );
        assert_eq!(parse_data(Some("42")).unwrap(), json!(42));
    }

    #[test]
    fn test_invalid_data_is_rejected() {
        let err = parse_data(Some("{not json")).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON data"));
    }
}
