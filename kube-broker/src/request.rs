//! Request-scoped context carried through every broker operation.
//!
//! The upstream auth middleware extracts the caller's bearer token and hands
//! it over here; the cancellation token mirrors the lifetime of the inbound
//! request, so an abandoned request aborts its in-flight cluster calls.
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

/// Per-request state: optional caller bearer token, optional trace
/// correlator, and a cancellation handle.
///
/// Cloning is cheap and clones share the same cancellation state.
#[derive(Clone, Default)]
pub struct RequestContext {
    bearer_token: Option<SecretString>,
    trace_id: Option<String>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// An empty context: no token, no trace, never cancelled until asked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the caller's bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(SecretString::from(token.into()));
        self
    }

    /// Attach a trace correlator, forwarded as the `trace-id` impersonation extra.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Use an externally owned cancellation token (e.g. a request-scoped
    /// child token of a server-wide shutdown token).
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// The caller's bearer token, if one was extracted upstream.
    pub fn bearer_token(&self) -> Option<&SecretString> {
        self.bearer_token.as_ref()
    }

    /// The trace correlator, if any. Empty strings count as absent.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref().filter(|t| !t.is_empty())
    }

    /// The cancellation handle for this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the request has already been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("bearer_token", &self.bearer_token.is_some())
            .field("trace_id", &self.trace_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn empty_trace_ids_count_as_absent() {
        assert_eq!(RequestContext::new().trace_id(), None);
        assert_eq!(RequestContext::new().with_trace_id("").trace_id(), None);
        assert_eq!(
            RequestContext::new().with_trace_id("abc-123").trace_id(),
            Some("abc-123")
        );
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancellation().cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn debug_output_hides_the_token() {
        let ctx = RequestContext::new().with_bearer_token("sekrit");
        assert_eq!(ctx.bearer_token().unwrap().expose_secret(), "sekrit");
        assert!(!format!("{ctx:?}").contains("sekrit"));
    }
}
