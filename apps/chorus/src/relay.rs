//! WebSocket connection to the signaling relay.
//!
//! JSON text frames in both directions. The writer and reader run on their
//! own tasks; the coordinator sees the relay as a [`RelaySink`] plus a stream
//! of [`ServerMessage`]s that ends when the socket does.

use std::sync::Arc;

use chorus_core::{RelaySink, TransportError};
use chorus_proto::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub struct WsRelay {
    send_tx: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRelay {
    /// Connect to an endpoint already normalised by [`derive_websocket_url`].
    pub async fn connect(
        url: &Url,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>), TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!(target = "relay", error = %err, "websocket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target = "relay", error = %err, "websocket read failed");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        tracing::trace!(target = "relay", kind = message.kind(), "ws_in");
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "relay", error = %err, len = text.len(), "ignoring unparseable frame");
                    }
                }
            }
            tracing::info!(target = "relay", "signaling websocket closed");
        });

        let relay = Arc::new(Self {
            send_tx,
            tasks: vec![writer, reader],
        });
        Ok((relay, inbound_rx))
    }
}

impl RelaySink for WsRelay {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let text = encode(&message)?;
        self.send_tx
            .send(text)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn encode(message: &ClientMessage) -> Result<String, TransportError> {
    Ok(serde_json::to_string(message)?)
}

/// Normalise the configured endpoint into a `ws`/`wss` URL.
pub fn derive_websocket_url(signaling_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        TransportError::Setup(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling url scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        let url = derive_websocket_url("https://relay.example.org/ws").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.org/ws");

        let url = derive_websocket_url("http://127.0.0.1:8080/ws#frag").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn websocket_urls_pass_through() {
        let url = derive_websocket_url("ws://127.0.0.1:8080/ws?room=demo").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws?room=demo");
    }

    #[test]
    fn outbound_messages_are_tagged_json_text() {
        let text = encode(&ClientMessage::Join {
            display_name: "Alice".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["display_name"], "Alice");
    }

    #[tokio::test]
    async fn send_after_writer_exit_reports_closed_channel() {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        drop(send_rx);
        let relay = WsRelay {
            send_tx,
            tasks: Vec::new(),
        };
        let err = relay
            .send(ClientMessage::Chat {
                sender_name: "Alice".into(),
                text: "hi".into(),
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }

    #[test]
    fn other_schemes_are_rejected() {
        assert!(matches!(
            derive_websocket_url("ftp://relay.example.org"),
            Err(TransportError::Setup(_))
        ));
        assert!(derive_websocket_url("not a url").is_err());
    }
}
