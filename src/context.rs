use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use http::{Extensions, HeaderMap};
use tokio::time::Instant;

use crate::auth::Claims;
use crate::logging::ContextLog;
use crate::state::{Authed, Authorized, ContextState, Unauthed};

/// Per-request state threaded explicitly through every call.
///
/// `RequestContext<S>` carries the request's deadline, its propagated
/// headers, the authenticated [`Claims`] and a verbose-logging flag. It is
/// created when a request arrives and dropped when the response is written;
/// it is never shared between requests.
///
/// The type parameter tracks authorization:
///
/// ```text
/// RequestContext<Unauthed> --authenticate--> RequestContext<Authed> --authorize--> RequestContext<Authorized>
/// ```
///
/// Handlers receive `RequestContext<Authorized>` (the default parameter).
/// Middleware sees `RequestContext<Unauthed>` and is the only stage allowed
/// to attach ambient values.
///
/// # Construction
///
/// Contexts are created by the request pipeline; user code cannot build
/// one. Downstream clients read the deadline and headers from it:
///
/// ```ignore
/// async fn handler(ctx: RequestContext, req: Req, clients: DownstreamClients) -> Result<Resp, ErrorEnvelope> {
///     ctx.log().info(format_args!("{} ms left", ctx.remaining().as_millis()));
///     clients.call(&ctx, "backend.Encode", &req).await
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext<S = Authorized> {
    request_id: Arc<str>,
    operation: Arc<str>,
    deadline: Instant,
    headers: HeaderMap,
    claims: Option<Arc<Claims>>,
    verbose: bool,
    extensions: Extensions,
    _state: PhantomData<S>,
}

// ============================================================================
// Shared methods (available on all states)
// ============================================================================

impl<S: ContextState> RequestContext<S> {
    /// Identifier taken from `x-request-id` or generated on arrival.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Name of the operation being served.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Instant after which the request has failed.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Headers propagated to downstream calls.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of header `name`, if it is valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Claims attached by authentication.
    ///
    /// `None` for `RequestContext<Unauthed>` and for operations without an
    /// authorization rule.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_deref()
    }

    /// Whether debug events of this request are promoted to info.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// An ambient value attached by middleware.
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// Request-scoped logger.
    pub fn log(&self) -> ContextLog<'_> {
        ContextLog::new(&self.request_id, &self.operation, self.verbose)
    }

    /// A copy of this context whose deadline is the earlier of the current
    /// one and `deadline`. The budget can shrink, never grow.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut next = self.clone();
        next.deadline = next.deadline.min(deadline);
        next
    }

    fn transition<T>(self) -> RequestContext<T> {
        RequestContext {
            request_id: self.request_id,
            operation: self.operation,
            deadline: self.deadline,
            headers: self.headers,
            claims: self.claims,
            verbose: self.verbose,
            extensions: self.extensions,
            _state: PhantomData,
        }
    }
}

// ============================================================================
// RequestContext<Unauthed> - Initial state
// ============================================================================

impl RequestContext<Unauthed> {
    /// Creates the context of an arriving request.
    pub(crate) fn new(
        request_id: impl Into<Arc<str>>,
        operation: impl Into<Arc<str>>,
        deadline: Instant,
        headers: HeaderMap,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            operation: operation.into(),
            deadline,
            headers,
            claims: None,
            verbose: false,
            extensions: Extensions::new(),
            _state: PhantomData,
        }
    }

    /// Attaches an ambient value readable through [`extension`](Self::extension).
    pub fn with_extension<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    /// Sets the verbose-logging flag.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Attaches the claims produced by the authenticator.
    pub fn authenticate(self, claims: Claims) -> RequestContext<Authed> {
        let mut next = self.transition::<Authed>();
        next.claims = Some(Arc::new(claims));
        next
    }

    /// Skips authorization for operations that declare no rule.
    pub(crate) fn admit_anonymous(self) -> RequestContext<Authorized> {
        self.transition()
    }
}

// ============================================================================
// RequestContext<Authed> - Authenticated, rule not yet evaluated
// ============================================================================

impl RequestContext<Authed> {
    /// Marks the rule as satisfied.
    ///
    /// Only [`AuthGate`](crate::AuthGate) calls this, after the rule
    /// evaluated to `true`.
    pub(crate) fn authorize(self) -> RequestContext<Authorized> {
        self.transition()
    }
}

#[cfg(test)]
pub(crate) fn test_context(timeout: Duration) -> RequestContext<Authorized> {
    RequestContext::new("req-test", "Test", Instant::now() + timeout, HeaderMap::new())
        .admit_anonymous()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tenant(&'static str);

    fn unauthed() -> RequestContext<Unauthed> {
        let mut headers = HeaderMap::new();
        headers.insert("x", "1".parse().unwrap());
        RequestContext::new(
            "req-1",
            "Encode",
            Instant::now() + Duration::from_secs(5),
            headers,
        )
    }

    #[test]
    fn unauthed_has_no_claims() {
        let ctx = unauthed();
        assert!(ctx.claims().is_none());
        assert_eq!(ctx.request_id(), "req-1");
        assert_eq!(ctx.header("x"), Some("1"));
    }

    #[test]
    fn claims_survive_transitions() {
        let ctx = unauthed()
            .authenticate(Claims::default().with_scopes(["a"]))
            .authorize();
        assert_eq!(ctx.claims().unwrap().scopes(), ["a"]);
        assert_eq!(ctx.operation(), "Encode");
    }

    #[test]
    fn extensions_and_verbose_come_from_middleware() {
        let ctx = unauthed()
            .with_extension(Tenant("acme"))
            .with_verbose(true)
            .admit_anonymous();
        assert_eq!(ctx.extension::<Tenant>(), Some(&Tenant("acme")));
        assert!(ctx.is_verbose());
        assert!(ctx.extension::<u8>().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_only_shrinks() {
        let ctx = test_context(Duration::from_secs(2));
        let later = ctx.with_deadline(Instant::now() + Duration::from_secs(10));
        assert_eq!(later.deadline(), ctx.deadline());

        let sooner = ctx.with_deadline(Instant::now() + Duration::from_millis(100));
        assert!(sooner.remaining() <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(sooner.is_expired());
        assert!(!ctx.is_expired());
        assert_eq!(sooner.remaining(), Duration::ZERO);
    }
}
