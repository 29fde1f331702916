use std::sync::Arc;

use tracing::{debug, info, warn};

use salesnote_core::config::Messages;

use crate::dedup::DedupCache;
use crate::events::{GatewayEvent, MessageHandler, OutboundSender};
use crate::transport::{ChatTransport, ReconnectPolicy, TransportError};

/// Pumps transport events into the message handler. Reconnects with bounded
/// backoff and, once retries are exhausted, returns without crashing the
/// process.
pub struct GatewayRunner {
    transport: Arc<dyn ChatTransport>,
    handler: Arc<dyn MessageHandler>,
    outbound: Arc<dyn OutboundSender>,
    dedup: Arc<DedupCache>,
    reconnect_policy: ReconnectPolicy,
    messages: Messages,
}

impl GatewayRunner {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        handler: Arc<dyn MessageHandler>,
        outbound: Arc<dyn OutboundSender>,
        messages: Messages,
    ) -> GatewayRunner {
        let dedup = Arc::new(DedupCache::default());
        dedup.spawn_pruner();
        GatewayRunner {
            transport,
            handler,
            outbound,
            dedup,
            reconnect_policy: ReconnectPolicy::default(),
            messages,
        }
    }

    pub fn with_dedup(mut self, dedup: Arc<DedupCache>) -> GatewayRunner {
        self.dedup = dedup;
        self
    }

    pub async fn run(&self) {
        for attempt in 0..=self.reconnect_policy.max_retries {
            match self.connect_and_pump(attempt).await {
                Ok(()) => return,
                Err(transport_error) => {
                    warn!(
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "gateway transport failed"
                    );
                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            max_retries = self.reconnect_policy.max_retries,
                            "gateway retries exhausted; continuing process without chat intake"
                        );
                        return;
                    }
                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn connect_and_pump(&self, attempt: u32) -> Result<(), TransportError> {
        info!(attempt, "opening gateway transport connection");
        self.transport.connect().await?;
        info!(attempt, "gateway transport connected");

        loop {
            let Some(event) = self.transport.next_event().await? else {
                info!(attempt, "gateway transport stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            self.dispatch(event).await;
        }
    }

    pub async fn dispatch(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Message(message) => {
                if self.dedup.is_processed(&message.message_id) {
                    debug!(message_id = %message.message_id, "duplicate message ignored");
                    return;
                }
                info!(user_id = %message.user_id, chat_id = %message.chat_id,
                    message_id = %message.message_id, "inbound message");
                match self.handler.handle_message(&message).await {
                    Ok(()) => self.dedup.mark_processed(&message.message_id),
                    Err(handler_error) => {
                        // Left unmarked so a platform re-push can retry.
                        warn!(%handler_error, message_id = %message.message_id,
                            "message handling failed");
                    }
                }
            }
            GatewayEvent::NonText { chat_id, message_id, message_type } => {
                if self.dedup.is_processed(&message_id) {
                    return;
                }
                warn!(message_type, "unsupported message type");
                match self.outbound.send_message(&chat_id, &self.messages.text_only).await {
                    Ok(()) => self.dedup.mark_processed(&message_id),
                    Err(handler_error) => {
                        warn!(%handler_error, "text-only reply failed");
                    }
                }
            }
            GatewayEvent::UserEntered { user_id, chat_id } => {
                info!(%user_id, %chat_id, "user entered chat");
                if let Err(handler_error) =
                    self.handler.handle_user_entered(&user_id, &chat_id).await
                {
                    warn!(%handler_error, %user_id, "user-entered handling failed");
                }
            }
            GatewayEvent::Unsupported { event_type } => {
                debug!(event_type, "unsupported gateway event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::events::{HandlerError, InboundMessage};

    #[derive(Default)]
    struct Recording {
        handled: Mutex<Vec<String>>,
        entered: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle_message(&self, message: &InboundMessage) -> Result<(), HandlerError> {
            self.handled.lock().unwrap().push(message.message_id.clone());
            Ok(())
        }

        async fn handle_user_entered(
            &self,
            user_id: &str,
            _chat_id: &str,
        ) -> Result<(), HandlerError> {
            self.entered.lock().unwrap().push(user_id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl OutboundSender for Recording {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), HandlerError> {
            self.sent.lock().unwrap().push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn message(message_id: &str) -> GatewayEvent {
        GatewayEvent::Message(InboundMessage {
            user_id: "u1".to_string(),
            chat_id: "c1".to_string(),
            text: "hello".to_string(),
            message_id: message_id.to_string(),
            chat_type: "p2p".to_string(),
        })
    }

    fn runner(recording: Arc<Recording>) -> GatewayRunner {
        GatewayRunner::new(
            Arc::new(crate::transport::NoopTransport),
            recording.clone(),
            recording,
            Messages::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_message_id_is_dropped() {
        let recording = Arc::new(Recording::default());
        let runner = runner(recording.clone());

        runner.dispatch(message("m1")).await;
        runner.dispatch(message("m1")).await;
        runner.dispatch(message("m2")).await;

        let handled = recording.handled.lock().unwrap();
        assert_eq!(handled.as_slice(), ["m1", "m2"], "second delivery of m1 dropped");
    }

    #[tokio::test]
    async fn non_text_gets_canned_reply_once() {
        let recording = Arc::new(Recording::default());
        let runner = runner(recording.clone());

        let event = GatewayEvent::NonText {
            chat_id: "c1".to_string(),
            message_id: "m9".to_string(),
            message_type: "image".to_string(),
        };
        runner.dispatch(event.clone()).await;
        runner.dispatch(event).await;

        let sent = recording.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Messages::default().text_only);
    }

    #[tokio::test]
    async fn user_entered_reaches_handler() {
        let recording = Arc::new(Recording::default());
        let runner = runner(recording.clone());
        runner
            .dispatch(GatewayEvent::UserEntered {
                user_id: "u7".to_string(),
                chat_id: "c7".to_string(),
            })
            .await;
        assert_eq!(recording.entered.lock().unwrap().as_slice(), ["u7"]);
    }
}
