//! WebSocket transport: a long-lived JSON event stream from the bot
//! platform's gateway endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::events::{GatewayEvent, InboundMessage};
use crate::transport::{ChatTransport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    url: String,
    stream: Mutex<Option<WsStream>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> WsTransport {
        WsTransport { url: url.into(), stream: Mutex::new(None) }
    }
}

#[async_trait]
impl ChatTransport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|source| TransportError::Connect(source.to_string()))?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn next_event(&self) -> Result<Option<GatewayEvent>, TransportError> {
        loop {
            let frame = {
                let mut guard = self.stream.lock().await;
                let Some(stream) = guard.as_mut() else {
                    return Err(TransportError::Receive("not connected".to_string()));
                };
                stream.next().await
            };

            match frame {
                None => return Ok(None),
                Some(Err(source)) => {
                    return Err(TransportError::Receive(source.to_string()));
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Text(payload))) => {
                    match decode_frame(payload.as_str()) {
                        Some(event) => return Ok(Some(event)),
                        None => {
                            warn!("undecodable gateway frame skipped");
                            continue;
                        }
                    }
                }
                // Pings are answered by the protocol layer; binary frames
                // carry nothing we consume.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.stream.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Message {
        user_id: String,
        chat_id: String,
        message_id: String,
        #[serde(default)]
        chat_type: String,
        #[serde(default = "default_message_type")]
        message_type: String,
        #[serde(default)]
        text: String,
    },
    UserEntered {
        user_id: String,
        chat_id: String,
    },
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Decodes one wire frame. Unknown event types surface as `Unsupported`;
/// frames that are not JSON objects are dropped.
pub fn decode_frame(payload: &str) -> Option<GatewayEvent> {
    match serde_json::from_str::<WireEvent>(payload) {
        Ok(WireEvent::Message { user_id, chat_id, message_id, chat_type, message_type, text }) => {
            if message_type != "text" {
                return Some(GatewayEvent::NonText { chat_id, message_id, message_type });
            }
            Some(GatewayEvent::Message(InboundMessage {
                user_id,
                chat_id,
                text,
                message_id,
                chat_type,
            }))
        }
        Ok(WireEvent::UserEntered { user_id, chat_id }) => {
            Some(GatewayEvent::UserEntered { user_id, chat_id })
        }
        Err(_) => {
            let event_type = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|value| {
                    value.get("type").and_then(|t| t.as_str()).map(str::to_string)
                })?;
            Some(GatewayEvent::Unsupported { event_type })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_message() {
        let event = decode_frame(
            r#"{"type":"message","user_id":"ou_1","chat_id":"oc_1","message_id":"om_1",
                "chat_type":"p2p","message_type":"text","text":"你好"}"#,
        )
        .expect("decodes");
        let GatewayEvent::Message(message) = event else { panic!("expected message") };
        assert_eq!(message.user_id, "ou_1");
        assert_eq!(message.text, "你好");
    }

    #[test]
    fn decodes_non_text_as_non_text() {
        let event = decode_frame(
            r#"{"type":"message","user_id":"ou_1","chat_id":"oc_1","message_id":"om_2",
                "message_type":"image"}"#,
        )
        .expect("decodes");
        assert!(matches!(event, GatewayEvent::NonText { ref message_type, .. }
            if message_type == "image"));
    }

    #[test]
    fn decodes_user_entered() {
        let event =
            decode_frame(r#"{"type":"user_entered","user_id":"ou_2","chat_id":"oc_9"}"#)
                .expect("decodes");
        assert_eq!(
            event,
            GatewayEvent::UserEntered { user_id: "ou_2".into(), chat_id: "oc_9".into() }
        );
    }

    #[test]
    fn unknown_type_is_unsupported_and_garbage_is_dropped() {
        let event = decode_frame(r#"{"type":"reaction_added","emoji":"+1"}"#).expect("decodes");
        assert_eq!(event, GatewayEvent::Unsupported { event_type: "reaction_added".into() });
        assert!(decode_frame("not json at all").is_none());
    }
}
