use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use log::{debug, info};
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite};

use crate::config::TvConfig;

const DEFAULT_PORT: u16 = 3000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const LAUNCH_URI: &str = "ssap://system.launcher/launch";
const SCREEN_ON_URI: &str = "ssap://com.webos.service.tvpower/power/turnOnScreen";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("TV unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("TV rejected registration: {0}")]
    Registration(String),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("unexpected response from TV: {0}")]
    Protocol(String),
    #[error("command timed out")]
    Timeout,
}

/// The remote display boundary. Both operations are idempotent on the TV
/// side and report their outcome synchronously; retry policy lives with the
/// caller's transition logic, not here.
pub trait RemoteControl {
    async fn set_input(&self, target: &str) -> Result<(), RemoteError>;
    async fn set_power(&self, on: bool) -> Result<(), RemoteError>;
}

/// Controls an LG webOS TV over its SSAP websocket interface.
///
/// Each command opens a fresh connection, registers with the stored client
/// key, issues one request, and disconnects. Holding a connection open
/// between events buys nothing here (transitions are minutes apart) and a
/// fresh connect sidesteps half-dead sockets after the TV power-cycles.
pub struct WebOsClient {
    url: String,
    client_key: Option<String>,
}

impl WebOsClient {
    pub fn new(config: &TvConfig) -> Self {
        WebOsClient {
            url: format!(
                "ws://{}:{}",
                config.host,
                config.port.unwrap_or(DEFAULT_PORT)
            ),
            client_key: config.client_key.clone(),
        }
    }

    async fn command(&self, uri: &str, payload: Value) -> Result<(), RemoteError> {
        tokio::time::timeout(COMMAND_TIMEOUT, self.command_inner(uri, payload))
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    async fn command_inner(&self, uri: &str, payload: Value) -> Result<(), RemoteError> {
        debug!("Connecting to {}", self.url);
        let (mut ws, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|source| RemoteError::Unreachable {
                    url: self.url.clone(),
                    source,
                })?;

        let register = register_message(self.client_key.as_deref());
        ws.send(tungstenite::Message::Text(register.to_string()))
            .await?;

        // The TV answers the register with a pairing prompt response first
        // when the key is missing or stale; only "registered" means we may
        // issue requests.
        loop {
            let reply = next_json(&mut ws).await?;
            match reply["type"].as_str() {
                Some("registered") => break,
                Some("response") => {
                    debug!("Pairing prompt shown on TV, waiting for confirmation");
                }
                Some("error") => {
                    let _ = ws.close(None).await;
                    return Err(RemoteError::Registration(
                        reply["error"].as_str().unwrap_or("unknown error").to_string(),
                    ));
                }
                _ => {
                    let _ = ws.close(None).await;
                    return Err(RemoteError::Protocol(format!(
                        "unexpected registration reply: {reply}"
                    )));
                }
            }
        }

        let request = request_message("cmd", uri, payload);
        ws.send(tungstenite::Message::Text(request.to_string()))
            .await?;

        // Skip unrelated frames (subscription pushes etc.) until our id comes
        // back.
        let outcome = loop {
            let reply = next_json(&mut ws).await?;
            if reply["id"].as_str() != Some("cmd") {
                continue;
            }
            if reply["type"].as_str() == Some("error") {
                break Err(RemoteError::Protocol(
                    reply["error"].as_str().unwrap_or("unknown error").to_string(),
                ));
            }
            if reply["payload"]["returnValue"].as_bool() == Some(true) {
                break Ok(());
            }
            break Err(RemoteError::Protocol(format!(
                "request refused: {}",
                reply["payload"]
            )));
        };

        let _ = ws.close(None).await;
        outcome
    }
}

impl RemoteControl for WebOsClient {
    async fn set_input(&self, target: &str) -> Result<(), RemoteError> {
        info!("Launching input app {target}");
        self.command(LAUNCH_URI, json!({ "id": target })).await
    }

    async fn set_power(&self, on: bool) -> Result<(), RemoteError> {
        // The reconciler never asks for power-off; the TV is left alone on
        // disconnect by design.
        if !on {
            return Ok(());
        }
        info!("Turning TV screen on");
        self.command(SCREEN_ON_URI, json!({ "standbyMode": "active" }))
            .await
    }
}

async fn next_json<S>(ws: &mut S) -> Result<Value, RemoteError>
where
    S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| RemoteError::Protocol("connection closed mid-command".to_string()))??;
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|err| RemoteError::Protocol(format!("invalid JSON from TV: {err}")));
            }
            // Pings are answered by tungstenite itself
            _ => continue,
        }
    }
}

fn register_message(client_key: Option<&str>) -> Value {
    let mut payload = json!({
        "pairingType": "PROMPT",
        "manifest": {
            "manifestVersion": 1,
            "permissions": ["LAUNCH", "CONTROL_POWER", "CONTROL_DISPLAY"],
        },
    });
    if let Some(key) = client_key {
        payload["client-key"] = Value::String(key.to_string());
    }
    json!({
        "id": "register",
        "type": "register",
        "payload": payload,
    })
}

fn request_message(id: &str, uri: &str, payload: Value) -> Value {
    json!({
        "id": id,
        "type": "request",
        "uri": uri,
        "payload": payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_message_carries_client_key() {
        let msg = register_message(Some("deadbeef"));
        assert_eq!(msg["type"], "register");
        assert_eq!(msg["payload"]["client-key"], "deadbeef");
        assert_eq!(msg["payload"]["pairingType"], "PROMPT");
    }

    #[test]
    fn test_register_message_without_key() {
        let msg = register_message(None);
        assert!(msg["payload"].get("client-key").is_none());
    }

    #[test]
    fn test_request_message_shape() {
        let msg = request_message("cmd", LAUNCH_URI, json!({ "id": "com.webos.app.hdmi2" }));
        assert_eq!(msg["type"], "request");
        assert_eq!(msg["uri"], "ssap://system.launcher/launch");
        assert_eq!(msg["payload"]["id"], "com.webos.app.hdmi2");
    }

    #[test]
    fn test_default_url() {
        let client = WebOsClient::new(&crate::config::TvConfig {
            host: "192.168.1.50".to_string(),
            port: None,
            client_key: None,
        });
        assert_eq!(client.url, "ws://192.168.1.50:3000");
    }
}
