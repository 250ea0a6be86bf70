//! Claims-based authorization.
//!
//! A bearer credential is authenticated into [`Claims`], then every rule of
//! the operation's [`AuthGate`] is evaluated against them. Rules are small
//! boolean [`Expr`]essions over scope and claim predicates.

mod authenticate;
mod claims;
mod expr;
mod gate;

pub use authenticate::{
    unsigned_token, AuthError, AuthErrorCode, Authenticator, InsecureJwtAuthenticator,
    StaticTokenAuthenticator,
};
pub use claims::Claims;
pub use expr::{ClaimSource, Expr, ExprError};
pub use gate::{bearer_token, AuthGate};
