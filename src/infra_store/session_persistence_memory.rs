use crate::application_port::SessionError;
use crate::domain_model::Session;
use crate::domain_port::SessionPersistence;
use std::sync::Mutex;

/// Process-local persistence, for ephemeral clients and tests.
#[derive(Debug, Default)]
pub struct MemorySessionPersistence {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }

    pub fn stored(&self) -> Option<Session> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl SessionPersistence for MemorySessionPersistence {
    fn load(&self) -> Result<Option<Session>, SessionError> {
        let slot = self
            .slot
            .lock()
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        Ok(slot.clone())
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        *slot = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        *slot = None;
        Ok(())
    }
}
