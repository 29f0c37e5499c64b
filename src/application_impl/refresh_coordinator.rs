use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::{ExchangeError, TokenExchange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Outcome = Result<TokenPair, RefreshError>;

enum RefreshState {
    Idle,
    /// Ledger of callers waiting for the exchange in flight.
    Refreshing { ledger: Vec<oneshot::Sender<Outcome>> },
}

struct DeadToken {
    refresh_token: RefreshToken,
    error: RefreshError,
}

struct Shared {
    state: Mutex<RefreshState>,
    dead_token: Mutex<Option<DeadToken>>,
    attempts: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight refresh: however many callers ask at once, one exchange
/// runs and everyone gets its outcome.
///
/// The exchange itself runs on a spawned worker, so a caller that gives up
/// waiting cannot leave the coordinator stuck in `Refreshing`.
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
    session_store: Arc<dyn SessionStore>,
    token_exchange: Arc<dyn TokenExchange>,
}

impl RefreshCoordinator {
    pub fn new(
        session_store: Arc<dyn SessionStore>,
        token_exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RefreshState::Idle),
                dead_token: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
            session_store,
            token_exchange,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*lock(&self.shared.state), RefreshState::Refreshing { .. })
    }

    /// A refresh token the endpoint already rejected is not worth another
    /// round trip; the failure is replayed until a different token shows up.
    fn known_dead(&self, refresh_token: &RefreshToken) -> Option<RefreshError> {
        let mut dead = lock(&self.shared.dead_token);
        match dead.as_ref() {
            Some(entry) if entry.refresh_token == *refresh_token => Some(entry.error.clone()),
            Some(_) => {
                *dead = None;
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl TokenRefresher for RefreshCoordinator {
    async fn refresh(&self, rejected: &AccessToken) -> Outcome {
        let (waiter, outcome) = oneshot::channel();
        let start_worker = {
            let mut state = lock(&self.shared.state);
            match &mut *state {
                RefreshState::Refreshing { ledger } => {
                    ledger.push(waiter);
                    None
                }
                RefreshState::Idle => {
                    // the worker stores a new pair before it goes back to Idle,
                    // so a rotation that already finished is visible here
                    let session = self.session_store.get_session();
                    if session.is_authenticated() && session.access_token != *rejected {
                        tracing::debug!("session already rotated past the rejected token");
                        return Ok(session.token_pair());
                    }
                    if session.refresh_token.is_empty() {
                        return Err(RefreshError::NoRefreshToken);
                    }
                    if let Some(error) = self.known_dead(&session.refresh_token) {
                        tracing::debug!("refresh token already rejected, not retrying");
                        return Err(error);
                    }
                    *state = RefreshState::Refreshing {
                        ledger: vec![waiter],
                    };
                    Some(session)
                }
            }
        };

        if let Some(session) = start_worker {
            tokio::spawn(run_exchange(
                self.shared.clone(),
                self.session_store.clone(),
                self.token_exchange.clone(),
                session,
            ));
        }

        outcome.await.unwrap_or(Err(RefreshError::Abandoned))
    }
}

async fn run_exchange(
    shared: Arc<Shared>,
    session_store: Arc<dyn SessionStore>,
    token_exchange: Arc<dyn TokenExchange>,
    session: Session,
) {
    let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(attempt, role = %session.role, "refreshing access token");

    let outcome = match token_exchange
        .exchange(session.role, &session.refresh_token)
        .await
    {
        Ok(pair) => store_pair(session_store.as_ref(), &session, pair, attempt),
        Err(e) => Err(refresh_error(e, attempt)),
    };

    match &outcome {
        Ok(_) => tracing::info!(attempt, "access token refreshed"),
        Err(error) => {
            tracing::warn!(attempt, "token refresh failed: {error}");
            if let RefreshError::Rejected { .. } = error {
                *lock(&shared.dead_token) = Some(DeadToken {
                    refresh_token: session.refresh_token.clone(),
                    error: error.clone(),
                });
            }
        }
    }

    let ledger = {
        let mut state = lock(&shared.state);
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Refreshing { ledger } => ledger,
            RefreshState::Idle => Vec::new(),
        }
    };
    for waiter in ledger {
        let _ = waiter.send(outcome.clone());
    }
}

fn store_pair(
    session_store: &dyn SessionStore,
    used: &Session,
    pair: TokenPair,
    attempt: u64,
) -> Outcome {
    // logout or a fresh login while the exchange was in flight wins
    if session_store.get_session().refresh_token != used.refresh_token {
        tracing::info!(attempt, "session changed during refresh, discarding new pair");
        return Err(RefreshError::Abandoned);
    }

    let role = pair
        .scope
        .as_deref()
        .and_then(Role::from_scope)
        .unwrap_or(used.role);
    session_store
        .set_session(pair.clone(), role)
        .map_err(|e| RefreshError::Store {
            message: e.to_string(),
            attempt,
        })?;
    Ok(pair)
}

fn refresh_error(error: ExchangeError, attempt: u64) -> RefreshError {
    match error {
        ExchangeError::Rejected { status } => RefreshError::Rejected { status, attempt },
        ExchangeError::Status { status } => RefreshError::Status { status, attempt },
        ExchangeError::Transport(message) => RefreshError::Transport { message, attempt },
        ExchangeError::Malformed(message) => RefreshError::Malformed { message, attempt },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::PersistentSessionStore;
    use crate::infra_store::MemorySessionPersistence;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct ScriptedExchange {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<TokenPair, ExchangeError>,
    }

    impl ScriptedExchange {
        fn new(result: Result<TokenPair, ExchangeError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                result,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TokenExchange for ScriptedExchange {
        async fn exchange(
            &self,
            _role: Role,
            _refresh_token: &RefreshToken,
        ) -> Result<TokenPair, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    /// Backend behaviour for single-use refresh tokens: each token works once
    /// and a reused one is rejected.
    struct SingleUseExchange {
        calls: AtomicUsize,
        used: Mutex<Vec<RefreshToken>>,
    }

    #[async_trait::async_trait]
    impl TokenExchange for SingleUseExchange {
        async fn exchange(
            &self,
            _role: Role,
            refresh_token: &RefreshToken,
        ) -> Result<TokenPair, ExchangeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 2;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut used = lock(&self.used);
            if used.contains(refresh_token) {
                return Err(ExchangeError::Rejected { status: 401 });
            }
            used.push(refresh_token.clone());
            Ok(TokenPair::new(format!("A{n}"), format!("R{n}")))
        }
    }

    fn a(token: &str) -> AccessToken {
        AccessToken::from(token)
    }

    fn logged_in_store() -> Arc<dyn SessionStore> {
        let store = PersistentSessionStore::load(Arc::new(MemorySessionPersistence::new()));
        store
            .set_session(TokenPair::new("A1", "R1"), Role::User)
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let store = logged_in_store();
        let exchange = ScriptedExchange::new(Ok(TokenPair::new("A2", "R2")));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move { coordinator.refresh(&a("A1")).await }));
        }
        for task in tasks {
            let pair = task.await.unwrap().unwrap();
            assert_eq!(pair.access_token.as_str(), "A2");
        }

        assert_eq!(exchange.calls(), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.get_session().access_token.as_str(), "A2");
        assert_eq!(store.get_session().refresh_token.as_str(), "R2");
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_exchange() {
        let store: Arc<dyn SessionStore> = Arc::new(PersistentSessionStore::load(Arc::new(
            MemorySessionPersistence::new(),
        )));
        let exchange = ScriptedExchange::new(Ok(TokenPair::new("A2", "R2")));
        let coordinator = RefreshCoordinator::new(store, exchange.clone());

        assert_eq!(
            coordinator.refresh(&AccessToken::default()).await,
            Err(RefreshError::NoRefreshToken)
        );
        assert_eq!(exchange.calls(), 0);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn rejected_token_is_not_retried_until_login() {
        let store = logged_in_store();
        let exchange = ScriptedExchange::new(Err(ExchangeError::Rejected { status: 401 }));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let first = coordinator.refresh(&a("A1")).await.unwrap_err();
        let second = coordinator.refresh(&a("A1")).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.attempt(), Some(1));
        assert_eq!(exchange.calls(), 1);
        assert_eq!(store.get_session().access_token.as_str(), "A1");

        store
            .set_session(TokenPair::new("A9", "R9"), Role::User)
            .unwrap();
        let _ = coordinator.refresh(&a("A9")).await;
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn transient_failure_allows_another_attempt() {
        let store = logged_in_store();
        let exchange = ScriptedExchange::new(Err(ExchangeError::Transport("reset".into())));
        let coordinator = RefreshCoordinator::new(store, exchange.clone());

        assert!(coordinator.refresh(&a("A1")).await.is_err());
        assert!(coordinator.refresh(&a("A1")).await.is_err());
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_strand_the_state() {
        let store = logged_in_store();
        let exchange = ScriptedExchange::new(Ok(TokenPair::new("A2", "R2")));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));

        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(&a("A1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiting.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.get_session().access_token.as_str(), "A2");
    }

    #[tokio::test]
    async fn logout_during_refresh_discards_the_new_pair() {
        let store = logged_in_store();
        let exchange = ScriptedExchange::new(Ok(TokenPair::new("A2", "R2")));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange));

        let refreshing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh(&a("A1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear_session().unwrap();

        assert_eq!(refreshing.await.unwrap(), Err(RefreshError::Abandoned));
        assert!(!store.get_session().is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn caller_arriving_after_rotation_does_not_reuse_the_old_token() {
        let store = logged_in_store();
        let exchange = Arc::new(SingleUseExchange {
            calls: AtomicUsize::new(0),
            used: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), exchange.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move { coordinator.refresh(&a("A1")).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().access_token.as_str(), "A2");
        }

        // saw A1 refused, but only reaches the coordinator once R1 is spent
        let late = coordinator.refresh(&a("A1")).await.unwrap();
        assert_eq!(late.access_token.as_str(), "A2");
        assert_eq!(late.refresh_token.as_str(), "R2");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_session().refresh_token.as_str(), "R2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rejection_of_the_rotated_token_still_refreshes() {
        let store = logged_in_store();
        let exchange = Arc::new(SingleUseExchange {
            calls: AtomicUsize::new(0),
            used: Mutex::new(Vec::new()),
        });
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        coordinator.refresh(&a("A1")).await.unwrap();
        let next = coordinator.refresh(&a("A2")).await.unwrap();

        assert_eq!(next.access_token.as_str(), "A3");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }
}
