use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::HeaderMap;

use super::{AuthError, AuthErrorCode, Authenticator, Claims, Expr, ExprError};
use crate::context::RequestContext;
use crate::error::ErrorEnvelope;
use crate::state::{Authed, Authorized, Unauthed};

/// The authorization gate of one operation.
///
/// `AuthGate` is the only way a request context reaches the `Authorized`
/// state with claims attached. It extracts the bearer credential,
/// authenticates it and evaluates every required rule.
///
/// | Outcome | Error |
/// |---|---|
/// | no or malformed credential | [`ErrorEnvelope::Authentication`], no rule evaluated |
/// | authenticator rejects it | [`ErrorEnvelope::Authentication`] |
/// | a rule evaluates to false | [`ErrorEnvelope::Authorization`] |
/// | a rule fails to evaluate | [`ErrorEnvelope::Internal`] |
///
/// Rules are compiled when the gate is built, so a malformed rule fails at
/// startup rather than on the first request.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use service_core::{AuthGate, InsecureJwtAuthenticator};
///
/// let gate = AuthGate::new(Arc::new(InsecureJwtAuthenticator::new()))
///     .require("any(jwtHasScope('orders:read'), jwtHasScope('admin'))")
///     .unwrap()
///     .require("any(jwtHasScope('admin'), jwtHasScope('orders:read'))")
///     .unwrap();
/// assert_eq!(gate.rules().len(), 2);
///
/// assert!(AuthGate::new(Arc::new(InsecureJwtAuthenticator::new()))
///     .require("any(")
///     .is_err());
/// ```
#[derive(Debug, Clone)]
pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    rules: Vec<Arc<Expr>>,
}

impl AuthGate {
    /// A gate that admits any authenticated credential.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            rules: Vec::new(),
        }
    }

    /// Compiles `source` and adds it as a required rule. Identical rules are
    /// kept once.
    ///
    /// # Errors
    ///
    /// The [`ExprError`] of a malformed rule.
    pub fn require(self, source: &str) -> Result<Self, ExprError> {
        Ok(self.require_expr(Expr::compile(source)?))
    }

    /// Adds an already compiled rule.
    pub fn require_expr(mut self, expr: Expr) -> Self {
        if !self.rules.iter().any(|existing| **existing == expr) {
            self.rules.push(Arc::new(expr));
        }
        self
    }

    /// Required rules in order.
    pub fn rules(&self) -> &[Arc<Expr>] {
        &self.rules
    }

    /// Runs the state machine for one request.
    ///
    /// # Errors
    ///
    /// See the table on [`AuthGate`].
    pub async fn admit(
        &self,
        ctx: RequestContext<Unauthed>,
    ) -> Result<RequestContext<Authorized>, ErrorEnvelope> {
        let claims = {
            let token = bearer_token(ctx.headers()).ok_or_else(|| {
                AuthError::new(
                    AuthErrorCode::MissingCredential,
                    "no bearer credential in Authorization header",
                )
            })?;
            self.authenticator.authenticate(token).await?
        };

        let authed = ctx.authenticate(claims);
        self.evaluate(&authed)?;
        authed.log().debug(format_args!("authorized"));
        Ok(authed.authorize())
    }

    fn evaluate(&self, ctx: &RequestContext<Authed>) -> Result<(), ErrorEnvelope> {
        let empty = Claims::default();
        let claims = ctx.claims().unwrap_or(&empty);

        for rule in &self.rules {
            match rule.evaluate(claims) {
                Ok(true) => {}
                Ok(false) => {
                    ctx.log()
                        .warn(format_args!("authorization denied by rule {}", rule));
                    return Err(ErrorEnvelope::authorization(format!(
                        "rule {} not satisfied",
                        rule
                    )));
                }
                Err(err) => {
                    ctx.log()
                        .error(format_args!("authorization rule {} failed: {}", rule, err));
                    return Err(ErrorEnvelope::internal(err.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Extracts the token of an `Authorization: Bearer <token>` header.
/// The scheme is matched case-insensitively.
///
/// ```
/// use http::HeaderMap;
/// use service_core::bearer_token;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("authorization", "bearer abc.def.ghi".parse().unwrap());
/// assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
/// ```
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 7 || !value[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = value[7..].trim();
    (!token.is_empty()).then_some(token)
}
