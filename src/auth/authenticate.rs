use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use thiserror::Error;

use super::Claims;

/// Why a credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct AuthError {
    code: AuthErrorCode,
    message: String,
}

impl AuthError {
    /// Creates an error.
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rejection category.
    pub fn code(&self) -> AuthErrorCode {
        self.code
    }

    /// Detail message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Category of [`AuthError`]. The default error mapper renders
/// `UntrustedSource` as 403, `Unknown` as 500 and the rest as 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    /// No bearer credential on the request.
    MissingCredential,
    /// The credential could not be decoded.
    InvalidCredential,
    /// The credential is past its expiry.
    Expired,
    /// The credential was issued by a party that is not trusted.
    UntrustedSource,
    /// The authenticator itself failed.
    Unknown,
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "missing credential"),
            Self::InvalidCredential => write!(f, "invalid credential"),
            Self::Expired => write!(f, "expired credential"),
            Self::UntrustedSource => write!(f, "untrusted source"),
            Self::Unknown => write!(f, "authenticator failure"),
        }
    }
}

/// Turns a bearer credential into [`Claims`].
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Verifies `token` (the text after `Bearer `).
    ///
    /// # Errors
    ///
    /// An [`AuthError`] describing the rejection.
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Decodes JWT payloads **without checking signatures**.
///
/// Time claims (`exp`, `nbf`) are still enforced with a small leeway, and an
/// optional issuer allow-list rejects tokens from other issuers. Meant for
/// tests and for deployments where a gateway already verified the token.
#[derive(Debug, Clone)]
pub struct InsecureJwtAuthenticator {
    trusted_issuers: Option<BTreeSet<String>>,
    leeway: Duration,
}

impl Default for InsecureJwtAuthenticator {
    fn default() -> Self {
        Self {
            trusted_issuers: None,
            leeway: Duration::from_secs(1),
        }
    }
}

impl InsecureJwtAuthenticator {
    /// Accepts tokens from any issuer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only tokens whose `iss` is in `issuers`.
    pub fn with_trusted_issuers<I, S>(mut self, issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_issuers = Some(issuers.into_iter().map(Into::into).collect());
        self
    }

    /// Tolerance for `exp` and `nbf`.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    fn decode(&self, token: &str) -> Result<Map<String, Value>, AuthError> {
        let invalid = |message: String| AuthError::new(AuthErrorCode::InvalidCredential, message);

        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("token is not a three-part JWT".to_string()));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| invalid(format!("payload is not base64url: {}", err)))?;
        serde_json::from_slice(&bytes).map_err(|err| invalid(format!("payload is not a JSON object: {}", err)))
    }

    fn check_times(&self, claims: &Map<String, Value>) -> Result<(), AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| AuthError::new(AuthErrorCode::Unknown, err.to_string()))?
            .as_secs_f64();
        let leeway = self.leeway.as_secs_f64();

        if let Some(exp) = claims.get("exp").and_then(Value::as_f64) {
            if now > exp + leeway {
                return Err(AuthError::new(AuthErrorCode::Expired, "token has expired"));
            }
        }
        if let Some(nbf) = claims.get("nbf").and_then(Value::as_f64) {
            if now + leeway < nbf {
                return Err(AuthError::new(
                    AuthErrorCode::InvalidCredential,
                    "token is not valid yet",
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for InsecureJwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        let values = self.decode(token)?;
        self.check_times(&values)?;

        if let Some(trusted) = &self.trusted_issuers {
            let issuer = values.get("iss").and_then(Value::as_str).unwrap_or_default();
            if !trusted.contains(issuer) {
                return Err(AuthError::new(
                    AuthErrorCode::UntrustedSource,
                    format!("issuer '{}' is not trusted", issuer),
                ));
            }
        }
        Ok(Claims::new(values))
    }
}

/// Builds an unsigned JWT (`alg: none`) carrying `claims`.
///
/// Pairs with [`InsecureJwtAuthenticator`] in tests.
///
/// ```
/// use serde_json::json;
/// use service_core::unsigned_token;
///
/// let token = unsigned_token(&json!({"scope": "fizz"}));
/// assert_eq!(token.matches('.').count(), 2);
/// ```
pub fn unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}

/// Maps fixed tokens to fixed claims.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenAuthenticator {
    /// An authenticator that knows no tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `token` as `claims`.
    pub fn with_token(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::new(AuthErrorCode::InvalidCredential, "unknown token"))
    }
}
