use crate::domain_model::*;
use crate::realtime::{RealtimeError, Subscription};
use std::sync::Arc;

pub type ChatHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[async_trait::async_trait]
pub trait ChatChannel: Send + Sync {
    fn subscribe_to_conversation(
        &self,
        conversation: &ConversationId,
        on_message: ChatHandler,
    ) -> Subscription;
    async fn publish_to_conversation(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<(), RealtimeError>;
}
