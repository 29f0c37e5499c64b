use crate::application_port::*;
use crate::domain_model::*;
use crate::realtime::{ConnectionManager, InboundMessage, RealtimeError, Subscription};
use std::sync::Arc;

/// Chat conversations over the shared realtime connection. Bodies travel as
/// JSON both ways.
pub struct StompChatChannel {
    connection: Arc<ConnectionManager>,
    session_store: Arc<dyn SessionStore>,
}

impl StompChatChannel {
    pub fn new(connection: Arc<ConnectionManager>, session_store: Arc<dyn SessionStore>) -> Self {
        Self {
            connection,
            session_store,
        }
    }
}

fn decode_chat(message: &InboundMessage) -> Result<serde_json::Value, RealtimeError> {
    serde_json::from_str(&message.body).map_err(|e| RealtimeError::MalformedMessage(e.to_string()))
}

#[async_trait::async_trait]
impl ChatChannel for StompChatChannel {
    fn subscribe_to_conversation(
        &self,
        conversation: &ConversationId,
        on_message: ChatHandler,
    ) -> Subscription {
        let conversation_id = conversation.clone();
        self.connection
            .subscribe(conversation.subscribe_topic(), move |message| {
                match decode_chat(&message) {
                    Ok(value) => on_message(value),
                    Err(e) => tracing::warn!(%conversation_id, "dropping chat frame: {e}"),
                }
            })
    }

    async fn publish_to_conversation(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<(), RealtimeError> {
        let role = self.session_store.get_session().role;
        let chat = OutgoingChat {
            content: content.to_owned(),
        };
        self.connection
            .publish_json(&conversation.publish_destination(role), &chat)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(body: &str) -> InboundMessage {
        InboundMessage {
            destination: "/sub/chat.1".to_owned(),
            message_id: None,
            body: body.to_owned(),
        }
    }

    #[test]
    fn chat_bodies_decode_as_json() {
        let value = decode_chat(&inbound(r#"{"content":"hi","sender":3}"#)).unwrap();
        assert_eq!(value["content"], "hi");

        let err = decode_chat(&inbound("hi")).unwrap_err();
        assert!(matches!(err, RealtimeError::MalformedMessage(_)));
    }
}
