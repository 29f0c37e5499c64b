use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::SessionPersistence;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

pub struct PersistentSessionStore {
    persistence: Arc<dyn SessionPersistence>,
    current: watch::Sender<Session>,
    // serializes persist-then-publish so two writers cannot interleave
    write_lock: Mutex<()>,
    login_hooks: Mutex<Vec<LoginHook>>,
}

impl PersistentSessionStore {
    /// Restores the last persisted session. An unreadable record is logged
    /// and treated as logged out.
    pub fn load(persistence: Arc<dyn SessionPersistence>) -> Self {
        let session = match persistence.load() {
            Ok(Some(session)) => {
                tracing::info!(role = %session.role, "restored persisted session");
                session
            }
            Ok(None) => Session::default(),
            Err(e) => {
                tracing::warn!("discarding unreadable session: {e}");
                Session::default()
            }
        };
        let (current, _) = watch::channel(session);

        Self {
            persistence,
            current,
            write_lock: Mutex::new(()),
            login_hooks: Mutex::new(Vec::new()),
        }
    }

    fn run_login_hooks(&self, session: &Session) {
        let hooks = self
            .login_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(session);
        }
    }
}

impl SessionStore for PersistentSessionStore {
    fn get_session(&self) -> Session {
        self.current.borrow().clone()
    }

    fn set_session(&self, pair: TokenPair, role: Role) -> Result<(), SessionError> {
        let session = Session::from_pair(pair, role);
        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.persistence.save(&session)?;
            self.current.send_replace(session.clone());
        }
        tracing::debug!(role = %session.role, "session stored");
        // Hooks run outside the write lock, so racing logins may run theirs
        // out of write order. Hooks read the store for the current session
        // instead of trusting the argument.
        self.run_login_hooks(&session);
        Ok(())
    }

    fn clear_session(&self) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.persistence.clear()?;
        let previous = self.current.send_replace(Session::default());
        if previous.is_authenticated() {
            tracing::info!("session cleared");
        }
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Session> {
        self.current.subscribe()
    }

    fn on_login(&self, hook: LoginHook) {
        self.login_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_store::MemorySessionPersistence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_with(persistence: Arc<MemorySessionPersistence>) -> PersistentSessionStore {
        PersistentSessionStore::load(persistence)
    }

    #[test]
    fn restores_what_was_persisted() {
        let saved = Session::from_pair(TokenPair::new("A1", "R1"), Role::Manager);
        let persistence = Arc::new(MemorySessionPersistence::with_session(saved.clone()));

        let store = store_with(persistence);
        assert_eq!(store.get_session(), saved);
    }

    #[test]
    fn set_session_persists_before_hooks_run() {
        let persistence = Arc::new(MemorySessionPersistence::new());
        let store = store_with(persistence.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = seen.clone();
        let persistence_in_hook = persistence.clone();
        store.on_login(Arc::new(move |session: &Session| {
            assert_eq!(persistence_in_hook.stored().as_ref(), Some(session));
            seen_in_hook.fetch_add(1, Ordering::SeqCst);
        }));

        store
            .set_session(TokenPair::new("A1", "R1"), Role::User)
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(store.get_session().is_authenticated());
    }

    #[test]
    fn clear_is_idempotent_and_visible_to_subscribers() {
        let persistence = Arc::new(MemorySessionPersistence::new());
        let store = store_with(persistence.clone());
        store
            .set_session(TokenPair::new("A1", "R1"), Role::User)
            .unwrap();
        let mut updates = store.subscribe();

        store.clear_session().unwrap();
        store.clear_session().unwrap();

        assert!(updates.has_changed().unwrap());
        assert!(!updates.borrow_and_update().is_authenticated());
        assert_eq!(store.get_session(), Session::default());
        assert!(persistence.stored().is_none());
    }

    #[test]
    fn racing_logins_leave_hooks_reading_the_final_session() {
        let store = Arc::new(store_with(Arc::new(MemorySessionPersistence::new())));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&store);
        let seen_in_hook = seen.clone();
        store.on_login(Arc::new(move |_: &Session| {
            if let Some(store) = weak.upgrade() {
                seen_in_hook.lock().unwrap().push(store.get_session());
            }
        }));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .set_session(TokenPair::new(format!("A{i}"), format!("R{i}")), Role::User)
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // the last writer's hook runs after every write, so it saw the winner
        let last = store.get_session();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.contains(&last));
    }
}
