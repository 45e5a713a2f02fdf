//! Error-set matching shared by retry, circuit breaker, and fallback.
//!
//! Rust has no exception hierarchy, so an [`ErrorMatcher`] decides membership in one of three
//! ways: by concrete type (a downcast), by the [`ErrorKind`] of a strategy-generated error, or by
//! an arbitrary predicate when a family of errors has to be matched together.
//!
//! An [`ErrorDecision`] pairs two sets. Errors in the *expected* set are treated as benign (not
//! retried, counted as success by a breaker, not handed to a fallback); errors in the *failure*
//! set are treated as failures. Expected wins when both match. When neither matches the error
//! itself, the decision can optionally walk the `source()` chain.
use crate::error::{ErrorKind, ResilienceError};
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

type MatchFn = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// One member of an [`ErrorSet`].
#[derive(Clone)]
pub struct ErrorMatcher {
    name: Cow<'static, str>,
    matches: MatchFn,
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

impl ErrorMatcher {
    /// Match errors whose concrete type is `T`.
    pub fn of<T: Error + 'static>() -> Self {
        Self {
            name: Cow::Borrowed(std::any::type_name::<T>()),
            matches: Arc::new(|e| e.is::<T>()),
        }
    }

    /// Match strategy-generated errors of the given kind.
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            name: Cow::Owned(format!("{:?}", kind)),
            matches: Arc::new(move |e| {
                e.downcast_ref::<ResilienceError>().and_then(ResilienceError::kind) == Some(kind)
            }),
        }
    }

    /// Match with an arbitrary predicate.
    pub fn when<F>(name: impl Into<Cow<'static, str>>, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        Self { name: name.into(), matches: Arc::new(predicate) }
    }

    /// Match every error.
    pub fn any() -> Self {
        Self { name: Cow::Borrowed("*"), matches: Arc::new(|_| true) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        (self.matches)(error)
    }
}

/// A set of matchers; membership means at least one matcher accepts the error.
#[derive(Debug, Clone, Default)]
pub struct ErrorSet {
    matchers: Vec<ErrorMatcher>,
}

/// Guard against pathological `source()` chains.
const MAX_CAUSE_DEPTH: usize = 64;

impl ErrorSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The set containing every error.
    pub fn all() -> Self {
        Self { matchers: vec![ErrorMatcher::any()] }
    }

    pub fn of(matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        Self { matchers: matchers.into_iter().collect() }
    }

    pub fn with(mut self, matcher: ErrorMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Does the error itself belong to the set?
    pub fn includes(&self, error: &(dyn Error + 'static)) -> bool {
        self.matchers.iter().any(|m| m.matches(error))
    }

    /// Does the error or anything in its `source()` chain belong to the set?
    pub fn includes_in_chain(&self, error: &(dyn Error + 'static)) -> bool {
        let mut current = Some(error);
        let mut depth = 0;
        while let Some(e) = current {
            if depth == MAX_CAUSE_DEPTH {
                break;
            }
            if self.includes(e) {
                return true;
            }
            depth += 1;
            current = e.source();
        }
        false
    }
}

/// Classifies a failed outcome as expected or as a failure.
#[derive(Debug, Clone)]
pub struct ErrorDecision {
    failure: ErrorSet,
    expected: ErrorSet,
    inspect_cause_chain: bool,
}

impl Default for ErrorDecision {
    /// Everything is a failure, nothing is expected, causes are not inspected.
    fn default() -> Self {
        Self { failure: ErrorSet::all(), expected: ErrorSet::empty(), inspect_cause_chain: false }
    }
}

impl ErrorDecision {
    pub fn new(failure: ErrorSet, expected: ErrorSet) -> Self {
        Self { failure, expected, inspect_cause_chain: false }
    }

    pub fn inspect_cause_chain(mut self, inspect: bool) -> Self {
        self.inspect_cause_chain = inspect;
        self
    }

    pub fn failure_set(&self) -> &ErrorSet {
        &self.failure
    }

    pub fn expected_set(&self) -> &ErrorSet {
        &self.expected
    }

    /// `true` when the error should be treated as benign.
    pub fn is_expected(&self, error: &ResilienceError) -> bool {
        let e = error.as_error();
        if self.expected.includes(e) {
            return true;
        }
        if self.failure.includes(e) {
            return false;
        }
        if !self.inspect_cause_chain {
            return true;
        }
        if self.expected.includes_in_chain(e) {
            return true;
        }
        if self.failure.includes_in_chain(e) {
            return false;
        }
        true
    }

    /// `true` when the error should be treated as a failure.
    pub fn is_failure(&self, error: &ResilienceError) -> bool {
        !self.is_expected(error)
    }
}
