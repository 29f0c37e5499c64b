use crate::application_port::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Fan-out point for the forced-logout prompt. Fires at most once per failed
/// refresh attempt, no matter how many requests were waiting on it.
#[derive(Default)]
pub struct SessionExpiredSignal {
    callbacks: Mutex<Vec<SessionExpiredCallback>>,
    last_fired: AtomicU64,
}

impl SessionExpiredSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: SessionExpiredCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Returns whether the callbacks ran.
    pub fn raise(&self, event: SessionExpired) -> bool {
        if self.last_fired.fetch_max(event.attempt, Ordering::SeqCst) >= event.attempt {
            return false;
        }

        tracing::warn!(attempt = event.attempt, "session expired: {}", event.reason);
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&event);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn expired(attempt: u64) -> SessionExpired {
        SessionExpired {
            attempt,
            reason: RefreshError::Rejected {
                status: 401,
                attempt,
            },
        }
    }

    #[test]
    fn fires_once_per_attempt() {
        let signal = SessionExpiredSignal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        signal.subscribe(Arc::new(move |_: &SessionExpired| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(signal.raise(expired(1)));
        assert!(!signal.raise(expired(1)));
        assert!(signal.raise(expired(2)));
        assert!(!signal.raise(expired(1)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
