use crate::application_impl::SessionExpiredSignal;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::HttpTransport;
use std::sync::Arc;

const MAX_RETRIES: u8 = 1;

/// Per-call bookkeeping. The caller's request is never mutated.
#[derive(Debug)]
struct RequestContext {
    request: ApiRequest,
    attempt: u8,
}

impl RequestContext {
    fn new(request: ApiRequest) -> Self {
        Self {
            request,
            attempt: 0,
        }
    }

    fn may_recover(&self) -> bool {
        self.attempt < MAX_RETRIES && !self.request.is_token_exchange()
    }
}

pub struct RealRequestAuthorizer {
    transport: Arc<dyn HttpTransport>,
    session_store: Arc<dyn SessionStore>,
    refresher: Arc<dyn TokenRefresher>,
    expiry_signal: Arc<SessionExpiredSignal>,
}

impl RealRequestAuthorizer {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session_store: Arc<dyn SessionStore>,
        refresher: Arc<dyn TokenRefresher>,
        expiry_signal: Arc<SessionExpiredSignal>,
    ) -> Self {
        Self {
            transport,
            session_store,
            refresher,
            expiry_signal,
        }
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        token: &AccessToken,
    ) -> Result<ApiResponse, RequestError> {
        let bearer = (!token.is_empty()).then(|| token.as_str());
        self.transport
            .send(&ctx.request, bearer)
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))
    }

    fn refresh_failed(&self, error: RefreshError) -> RequestError {
        match error.attempt() {
            Some(attempt) => {
                self.expiry_signal.raise(SessionExpired {
                    attempt,
                    reason: error,
                });
                RequestError::SessionExpired
            }
            None => match error {
                RefreshError::NoRefreshToken => RequestError::NoRefreshToken,
                _ => RequestError::Unauthorized,
            },
        }
    }
}

#[async_trait::async_trait]
impl RequestAuthorizer for RealRequestAuthorizer {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        let mut ctx = RequestContext::new(request);

        loop {
            let token = self.session_store.get_session().access_token;
            let response = self.send(&ctx, &token).await?;
            if !response.is_unauthorized() {
                return Ok(response);
            }
            if !ctx.may_recover() {
                tracing::debug!(
                    path = %ctx.request.path,
                    attempt = ctx.attempt,
                    "401 not recoverable"
                );
                return Err(RequestError::Unauthorized);
            }
            ctx.attempt += 1;

            // someone else already rotated the token while this request was out
            let current = self.session_store.get_session().access_token;
            if !current.is_empty() && current != token {
                tracing::debug!(path = %ctx.request.path, "retrying with rotated token");
                continue;
            }

            match self.refresher.refresh(&token).await {
                Ok(_) => {
                    tracing::debug!(path = %ctx.request.path, "retrying after refresh");
                }
                Err(e) => return Err(self.refresh_failed(e)),
            }
        }
    }
}
