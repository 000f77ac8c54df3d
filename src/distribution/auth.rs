use crate::error::*;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::{collections::HashMap, sync::Mutex};

/// Parsed `WWW-Authenticate` header
///
/// Based on [RFC 2617](https://www.rfc-editor.org/rfc/rfc2617#section-3.2.1)
/// and [RFC 6750](https://www.rfc-editor.org/rfc/rfc6750#section-3).
///
/// ```
/// use ocivm::distribution::WwwAuthenticate;
///
/// let auth = WwwAuthenticate::parse(
///   r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
/// ).unwrap();
///
/// assert_eq!(auth.scheme, "Bearer");
/// assert_eq!(auth.directives["scope"], "repository:samalba/my-app:pull,push");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WwwAuthenticate {
    pub scheme: String,
    pub directives: HashMap<String, String>,
}

impl WwwAuthenticate {
    pub fn parse(header: &str) -> Result<Self> {
        let err = |why: &str| Error::MalformedHeader(format!("{} ({:?})", why, header));
        let (scheme, raw_directives) = header
            .split_once(' ')
            .filter(|(scheme, rest)| !scheme.is_empty() && !rest.trim().is_empty())
            .ok_or_else(|| err("header should consist of a scheme and directives"))?;

        let mut directives = HashMap::new();
        for directive in quote_aware_comma_split(raw_directives) {
            let (key, value) = directive
                .split_once('=')
                .ok_or_else(|| err("each directive should be key=value or key=\"value\""))?;
            directives.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
        Ok(WwwAuthenticate {
            scheme: scheme.to_string(),
            directives,
        })
    }
}

/// Split on commas which are not inside a quoted value
fn quote_aware_comma_split(raw: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                result.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < raw.len() {
        result.push(&raw[start..]);
    }
    result
}

/// Response of the token endpoint named by the `realm` of a Bearer challenge
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    pub const DEFAULT_EXPIRES_IN: u64 = 60;

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().or(self.access_token.as_deref())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let issued_at = self.issued_at.unwrap_or_else(Utc::now);
        let expires_in = self.expires_in.unwrap_or(Self::DEFAULT_EXPIRES_IN);
        issued_at + Duration::seconds(expires_in as i64)
    }

    pub fn into_authentication(self) -> Result<Authentication> {
        let expires_at = self.expires_at();
        let token = self
            .token()
            .ok_or_else(|| Error::AuthorizationFailed("token response has no token".to_string()))?
            .to_string();
        Ok(Authentication::Bearer { token, expires_at })
    }
}

/// Credential attached to registry requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Basic { user: String, password: String },
    Bearer { token: String, expires_at: DateTime<Utc> },
}

impl Authentication {
    /// Value of the `Authorization` header
    pub fn header(&self) -> String {
        match self {
            Authentication::Basic { user, password } => {
                format!("Basic {}", base64::encode(format!("{}:{}", user, password)))
            }
            Authentication::Bearer { token, .. } => format!("Bearer {}", token),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Authentication::Basic { .. } => true,
            Authentication::Bearer { expires_at, .. } => Utc::now() < *expires_at,
        }
    }
}

/// Current authentication shared by all requests of a client
///
/// Concurrent layer transfers read and replace it through the mutex,
/// so a token transition is never observed half-way.
#[derive(Debug, Default)]
pub struct AuthenticationKeeper {
    authentication: Mutex<Option<Authentication>>,
}

impl AuthenticationKeeper {
    pub fn set(&self, authentication: Authentication) {
        *self.lock() = Some(authentication);
    }

    /// `Authorization` header value, unless there is no authentication or it has expired
    pub fn header(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .filter(|auth| auth.is_valid())
            .map(Authentication::header)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Authentication>> {
        // A panic while holding the lock cannot leave a half-written Option behind
        self.authentication
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn docker_example() -> Result<()> {
        // Example from the Docker token authentication specification
        let auth = WwwAuthenticate::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
        )?;
        assert_eq!(auth.scheme, "Bearer");
        assert_eq!(
            auth.directives,
            hashmap! {
                "realm".to_string() => "https://auth.docker.io/token".to_string(),
                "service".to_string() => "registry.docker.io".to_string(),
                "scope".to_string() => "repository:samalba/my-app:pull,push".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    fn unquoted_values() -> Result<()> {
        let auth = WwwAuthenticate::parse(r#"Bearer a=b,c="d""#)?;
        assert_eq!(
            auth.directives,
            hashmap! { "a".to_string() => "b".to_string(), "c".to_string() => "d".to_string() }
        );
        Ok(())
    }

    #[test]
    fn incomplete() {
        assert!(WwwAuthenticate::parse("Whatever").is_err());
        assert!(WwwAuthenticate::parse("Bearer ").is_err());
        assert!(WwwAuthenticate::parse("Bearer whatever").is_err());
    }

    #[test]
    fn token_response() -> Result<()> {
        let res: TokenResponse = serde_json::from_str(r#"{"token":"some token"}"#)?;
        assert_eq!(res.token(), Some("some token"));
        let before = Utc::now();
        let expires_at = res.expires_at();
        assert!(expires_at >= before + Duration::seconds(60));
        assert!(expires_at <= Utc::now() + Duration::seconds(60));

        let res: TokenResponse = serde_json::from_str(r#"{"access_token":"other"}"#)?;
        assert_eq!(res.token(), Some("other"));

        let res: TokenResponse = serde_json::from_str(
            r#"{"token":"t","expires_in":3600,"issued_at":"1970-01-01T00:00:00Z"}"#,
        )?;
        assert_eq!(res.expires_at().timestamp(), 3600);
        // Issued long ago, so it's already expired
        assert!(!res.into_authentication()?.is_valid());
        Ok(())
    }

    #[test]
    fn keeper_hides_expired_tokens() {
        let keeper = AuthenticationKeeper::default();
        assert_eq!(keeper.header(), None);

        keeper.set(Authentication::Bearer {
            token: "fresh".to_string(),
            expires_at: Utc::now() + Duration::seconds(60),
        });
        assert_eq!(keeper.header().as_deref(), Some("Bearer fresh"));

        keeper.set(Authentication::Bearer {
            token: "stale".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
        });
        assert_eq!(keeper.header(), None);

        keeper.set(Authentication::Basic {
            user: "user".to_string(),
            password: "pass".to_string(),
        });
        assert_eq!(keeper.header().as_deref(), Some("Basic dXNlcjpwYXNz"));
    }
}
