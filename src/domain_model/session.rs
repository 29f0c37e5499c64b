use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    User,
    Manager,
}

impl Role {
    /// Path segment the backend routes this role's endpoints under.
    pub fn base_path(&self) -> &'static str {
        match self {
            Role::User => "app",
            Role::Manager => "manager",
        }
    }

    /// Maps a token `scope` claim onto a role. Unknown scopes yield `None`
    /// so the caller can keep whatever role it already had.
    pub fn from_scope(scope: &str) -> Option<Role> {
        let scope = scope.trim().to_ascii_uppercase();
        let scope = scope.strip_prefix("ROLE_").unwrap_or(&scope);
        match scope {
            "MANAGER" => Some(Role::Manager),
            "USER" | "APP" => Some(Role::User),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "USER"),
            Role::Manager => write!(f, "MANAGER"),
        }
    }
}

// region tokens

#[derive(Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(pub String);

#[derive(Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

macro_rules! token_impls {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        // tokens end up in logs through `?session`, never print them whole
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.0.is_empty() {
                    return write!(f, "{}(<empty>)", stringify!($name));
                }
                let tail: String = self
                    .0
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                write!(f, "{}(…{})", stringify!($name), tail)
            }
        }
    };
}

token_impls!(AccessToken);
token_impls!(RefreshToken);

/// Token pair as issued by the token-exchange endpoint.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    #[serde(default)]
    pub authorization_identifier: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<AccessToken>, refresh_token: impl Into<RefreshToken>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            authorization_identifier: String::new(),
            scope: None,
        }
    }
}

// endregion

// region session

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub authorization_identifier: String,
    pub role: Role,
}

impl Session {
    pub fn from_pair(pair: TokenPair, role: Role) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            authorization_identifier: pair.authorization_identifier,
            role,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }

    pub fn token_pair(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            authorization_identifier: self.authorization_identifier.clone(),
            scope: None,
        }
    }
}

// endregion

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticated_only_with_both_tokens() {
        let mut session = Session::from_pair(TokenPair::new("A1", "R1"), Role::User);
        assert!(session.is_authenticated());

        session.refresh_token = RefreshToken::default();
        assert!(!session.is_authenticated());
        assert!(!Session::default().is_authenticated());
    }

    #[test]
    fn scope_maps_to_role() {
        assert_eq!(Role::from_scope("MANAGER"), Some(Role::Manager));
        assert_eq!(Role::from_scope("role_manager"), Some(Role::Manager));
        assert_eq!(Role::from_scope("USER"), Some(Role::User));
        assert_eq!(Role::from_scope("read write"), None);
    }

    #[test]
    fn token_pair_reads_backend_field_names() {
        let pair: TokenPair = serde_json::from_str(
            r#"{"accessToken":"A2","refreshToken":"R2","authorizationIdentifier":"42","scope":"MANAGER"}"#,
        )
        .unwrap();
        assert_eq!(pair.access_token.as_str(), "A2");
        assert_eq!(pair.refresh_token.as_str(), "R2");
        assert_eq!(pair.authorization_identifier, "42");
        assert_eq!(pair.scope.as_deref(), Some("MANAGER"));
    }

    #[test]
    fn debug_output_hides_token_body() {
        let token = AccessToken::from("eyJhbGciOiJIUzI1NiJ9.payload.sig1234");
        let printed = format!("{:?}", token);
        assert!(printed.ends_with("1234)"));
        assert!(!printed.contains("payload"));
    }
}
