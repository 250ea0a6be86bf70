//! Type-state markers for request context progression.
//!
//! A [`RequestContext`](crate::RequestContext) moves through these states as
//! the authorization engine runs:
//!
//! ```text
//! Unauthed --authenticate--> Authed --authorize--> Authorized
//! ```
//!
//! Handlers only ever receive `RequestContext<Authorized>`, so claims seen by
//! handler code are always the ones that passed the operation's rule.

use std::fmt;

mod sealed {
    pub trait Sealed {}
}

/// Implemented by the three context states. Sealed; not implementable
/// outside this crate.
pub trait ContextState: sealed::Sealed + Clone + fmt::Debug + Send + Sync + 'static {}

/// Marker for a context that has not presented a credential yet.
///
/// Middleware hooks run in this state and may attach ambient values.
#[derive(Debug, Clone, Copy)]
pub struct Unauthed {
    _private: (),
}

/// Marker for a context whose bearer credential produced [`Claims`](crate::Claims)
/// but whose rule has not been evaluated.
#[derive(Debug, Clone, Copy)]
pub struct Authed {
    _private: (),
}

/// Marker for a context that passed authorization (or belongs to an
/// operation that declares no rule).
#[derive(Debug, Clone, Copy)]
pub struct Authorized {
    _private: (),
}

impl sealed::Sealed for Unauthed {}
impl sealed::Sealed for Authed {}
impl sealed::Sealed for Authorized {}

impl ContextState for Unauthed {}
impl ContextState for Authed {}
impl ContextState for Authorized {}
