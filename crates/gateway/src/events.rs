use async_trait::async_trait;
use thiserror::Error;

/// A text message from the chat platform. `user_id` is the cross-application
/// union identifier; the transport resolves it from platform-native ids when
/// necessary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: String,
    pub chat_id: String,
    pub text: String,
    pub message_id: String,
    pub chat_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    Message(InboundMessage),
    /// Images, stickers, files: acknowledged with a canned reply.
    NonText { chat_id: String, message_id: String, message_type: String },
    UserEntered { user_id: String, chat_id: String },
    Unsupported { event_type: String },
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("message handling failed: {0}")]
    Message(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// What the core exposes to the gateway: one inbound text turn, one
/// user-entered-chat greeting.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &InboundMessage) -> Result<(), HandlerError>;
    async fn handle_user_entered(&self, user_id: &str, chat_id: &str)
        -> Result<(), HandlerError>;
}

/// Outbound edge of the chat platform.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), HandlerError>;
}
