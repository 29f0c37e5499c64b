use crate::domain_model::Role;
use reqwest::Method;
use serde::de::DeserializeOwned;

const TOKEN_EXCHANGE_SUFFIX: &str = "/auth/token";

pub fn token_exchange_path(role: Role) -> String {
    format!("/{}{}", role.base_path(), TOKEN_EXCHANGE_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, query string included.
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, None)
    }

    pub fn post(path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self::new(Method::POST, path, body)
    }

    pub fn put(path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self::new(Method::PUT, path, body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, None)
    }

    /// The token-exchange endpoint authenticates with the refresh token and
    /// must never go through 401 recovery.
    pub fn is_token_exchange(&self) -> bool {
        let path = self.path.split(['?', '#']).next().unwrap_or_default();
        path.trim_end_matches('/').ends_with(TOKEN_EXCHANGE_SUFFIX)
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
