use crate::domain_model::*;
use crate::domain_port::{ExchangeError, HttpTransport, TokenExchange};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    data: TokenPair,
}

/// Exchanges a refresh token at `POST /{role}/auth/token`. Talks to the
/// transport directly so the 401 recovery path never sees this call.
pub struct HttpTokenExchange {
    transport: Arc<dyn HttpTransport>,
}

impl HttpTokenExchange {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(
        &self,
        role: Role,
        refresh_token: &RefreshToken,
    ) -> Result<TokenPair, ExchangeError> {
        let request = ApiRequest::post(token_exchange_path(role), None);
        let response = self
            .transport
            .send(&request, Some(refresh_token.as_str()))
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        match response.status {
            401 | 403 => {
                return Err(ExchangeError::Rejected {
                    status: response.status,
                });
            }
            status if !response.is_success() => return Err(ExchangeError::Status { status }),
            _ => {}
        }

        let envelope: TokenEnvelope = response
            .json()
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        let pair = envelope.data;
        if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
            return Err(ExchangeError::Malformed("empty token in response".to_owned()));
        }
        Ok(pair)
    }
}
