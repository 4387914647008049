//! Response interception subsystem.
//!
//! # Data Flow
//! ```text
//! upstream Response
//!     → InterceptedResponse (body buffered on first read, restored for the next)
//!     → chain.rs: for each interceptor, in registration order
//!           rules (short-circuit on first `false`) ─ false ─▶ skip interceptor
//!               │ all true
//!               ▼
//!           handler (rewrites body + Content-Length) ─ Err ─▶ abort response
//!     → Response handed back to the client
//! ```
//!
//! # Design Decisions
//! - Interceptors register under unique names; execution follows insertion order
//! - Rules are predicates; only handlers may fail the response
//! - Handlers build the complete new body before touching the response

pub mod chain;
pub mod livereload;
pub mod response;
pub mod rules;

use futures_util::future::BoxFuture;

pub use chain::{ChainError, InterceptorChain};
pub use livereload::{LiveReload, LiveReloadError, DEFAULT_SNIPPET, UPGRADE_ENDPOINT_PLACEHOLDER};
pub use response::{InterceptError, InterceptedResponse};

/// A predicate deciding whether a response is eligible for a transform.
///
/// Rules may read the body through [`InterceptedResponse::read_body`], which
/// restores it for later rules and the handler.
pub trait Rule: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    fn check<'a>(&'a self, response: &'a mut InterceptedResponse) -> BoxFuture<'a, bool>;
}

/// A rule-gated response transform.
pub trait Interceptor: Send + Sync {
    /// Rules evaluated in order; the handler runs only if every one passes.
    fn rules(&self) -> &[Box<dyn Rule>];

    /// Transform applied once all rules have passed.
    fn handle<'a>(
        &'a self,
        response: &'a mut InterceptedResponse,
    ) -> BoxFuture<'a, Result<(), InterceptError>>;
}

/// A synchronous rule built from a closure over the response head.
pub struct FnRule<F> {
    name: &'static str,
    predicate: F,
}

/// Build a [`Rule`] from a predicate that does not need the body.
pub fn rule_fn<F>(name: &'static str, predicate: F) -> FnRule<F>
where
    F: Fn(&InterceptedResponse) -> bool + Send + Sync,
{
    FnRule { name, predicate }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&InterceptedResponse) -> bool + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn check<'a>(&'a self, response: &'a mut InterceptedResponse) -> BoxFuture<'a, bool> {
        let passed = (self.predicate)(response);
        Box::pin(futures_util::future::ready(passed))
    }
}
