use crate::domain_model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("refresh token rejected with status {status}")]
    Rejected { status: u16 },
    #[error("unexpected status {status}")]
    Status { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait::async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(
        &self,
        role: Role,
        refresh_token: &RefreshToken,
    ) -> Result<TokenPair, ExchangeError>;
}
