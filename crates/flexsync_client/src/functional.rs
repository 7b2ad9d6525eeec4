//! Move-only callbacks.

use std::fmt;

/// A callback that is owned by exactly one place and invoked at most once.
///
/// Calling an empty `UniqueFunction` panics: a completion handler that was
/// never installed is a bug, not something to skip silently.
pub struct UniqueFunction<A, R = ()> {
    f: Option<Box<dyn FnOnce(A) -> R + Send>>,
}

impl<A, R> UniqueFunction<A, R> {
    /// Wraps a closure.
    pub fn new(f: impl FnOnce(A) -> R + Send + 'static) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }

    /// A function with nothing to call.
    pub fn empty() -> Self {
        Self { f: None }
    }

    /// Returns true if a closure is held.
    pub fn is_set(&self) -> bool {
        self.f.is_some()
    }

    /// Invokes the closure.
    ///
    /// # Panics
    ///
    /// Panics if the function is empty.
    pub fn call(self, arg: A) -> R {
        match self.f {
            Some(f) => f(arg),
            None => panic!("called an empty UniqueFunction"),
        }
    }
}

impl<A, R> Default for UniqueFunction<A, R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A, R> fmt::Debug for UniqueFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueFunction")
            .field("set", &self.is_set())
            .finish()
    }
}

impl<A, R, F> From<F> for UniqueFunction<A, R>
where
    F: FnOnce(A) -> R + Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}
