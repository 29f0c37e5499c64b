use crate::application_port::SessionError;
use crate::domain_model::*;

/// Durable home of the session. Calls are synchronous so a write completes
/// before the store publishes the new value.
pub trait SessionPersistence: Send + Sync {
    /// `Ok(None)` when nothing was saved yet.
    fn load(&self) -> Result<Option<Session>, SessionError>;
    fn save(&self, session: &Session) -> Result<(), SessionError>;
    fn clear(&self) -> Result<(), SessionError>;
}
