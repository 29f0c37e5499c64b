use crate::domain_model::*;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("malformed session record: {0}")]
    Malformed(String),
}

pub type LoginHook = Arc<dyn Fn(&Session) + Send + Sync>;

/// Owner of the one live session. Every write is persisted before observers
/// see it.
pub trait SessionStore: Send + Sync {
    fn get_session(&self) -> Session;
    fn set_session(&self, pair: TokenPair, role: Role) -> Result<(), SessionError>;
    /// Idempotent.
    fn clear_session(&self) -> Result<(), SessionError>;
    fn subscribe(&self) -> watch::Receiver<Session>;
    fn on_login(&self, hook: LoginHook);
}
