use crate::domain_model::*;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("access token rejected")]
    Unauthorized,
    #[error("session expired, login required")]
    SessionExpired,
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outcome shared by every caller waiting on the same refresh, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("refresh token rejected with status {status} (attempt {attempt})")]
    Rejected { status: u16, attempt: u64 },
    #[error("token endpoint answered {status} (attempt {attempt})")]
    Status { status: u16, attempt: u64 },
    #[error("token endpoint unreachable: {message} (attempt {attempt})")]
    Transport { message: String, attempt: u64 },
    #[error("malformed token response: {message} (attempt {attempt})")]
    Malformed { message: String, attempt: u64 },
    #[error("failed to store refreshed session: {message} (attempt {attempt})")]
    Store { message: String, attempt: u64 },
    #[error("refresh abandoned")]
    Abandoned,
}

impl RefreshError {
    /// Exchange attempt this failure belongs to, if a network exchange ran.
    pub fn attempt(&self) -> Option<u64> {
        match self {
            RefreshError::Rejected { attempt, .. }
            | RefreshError::Status { attempt, .. }
            | RefreshError::Transport { attempt, .. }
            | RefreshError::Malformed { attempt, .. }
            | RefreshError::Store { attempt, .. } => Some(*attempt),
            RefreshError::NoRefreshToken | RefreshError::Abandoned => None,
        }
    }
}

/// Raised once per failed refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    pub attempt: u64,
    pub reason: RefreshError,
}

pub type SessionExpiredCallback = Arc<dyn Fn(&SessionExpired) + Send + Sync>;

#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    /// `rejected` is the access token the caller saw refused. When the
    /// session has already moved past it, the current pair comes back
    /// without another exchange.
    async fn refresh(&self, rejected: &AccessToken) -> Result<TokenPair, RefreshError>;
}

#[async_trait::async_trait]
pub trait RequestAuthorizer: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError>;
}
