use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::debug;

use salesnote_core::config::GatewayConfig;

use crate::events::{HandlerError, OutboundSender};

/// Outbound messages go over the platform's REST API rather than the event
/// socket; credentials ride along as app id/secret.
pub struct HttpOutbound {
    http: reqwest::Client,
    endpoint: String,
    app_id: String,
    app_secret: secrecy::SecretString,
}

impl HttpOutbound {
    pub fn new(config: &GatewayConfig, endpoint: impl Into<String>) -> HttpOutbound {
        HttpOutbound {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        }
    }
}

#[async_trait]
impl OutboundSender for HttpOutbound {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), HandlerError> {
        let body = json!({
            "receive_id": chat_id,
            "msg_type": "text",
            "content": { "text": text },
        });
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.app_id, Some(self.app_secret.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|source| HandlerError::Send(source.to_string()))?;

        if !response.status().is_success() {
            return Err(HandlerError::Send(format!(
                "send message failed with status {}",
                response.status()
            )));
        }
        debug!(chat_id, "message sent");
        Ok(())
    }
}
