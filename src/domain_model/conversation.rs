use crate::domain_model::Role;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Topic on which the backend fans out messages of this conversation.
    pub fn subscribe_topic(&self) -> String {
        format!("/sub/chat.{}", self.0)
    }

    /// Destination for outgoing messages. The backend routes by sender role.
    pub fn publish_destination(&self, role: Role) -> String {
        format!("/pub/{}/send.{}", role.base_path(), self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<u64> for ConversationId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Body published to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingChat {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_role_prefix() {
        let id = ConversationId::from(17);
        assert_eq!(id.subscribe_topic(), "/sub/chat.17");
        assert_eq!(id.publish_destination(Role::User), "/pub/app/send.17");
        assert_eq!(id.publish_destination(Role::Manager), "/pub/manager/send.17");
    }
}
