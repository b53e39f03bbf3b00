//! Completion callbacks delivered on the caller's loop.

use std::fmt;

/// A one-shot completion handler.
///
/// Firing consumes the handler, so a completion can be delivered at most once.
/// `Completion::default()` is a no-op handler for callers that only poll state.
pub struct Completion<T> {
    handler: Box<dyn FnOnce(T)>,
}

impl<T> Completion<T> {
    pub fn new(handler: impl FnOnce(T) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Handler that ignores the outcome.
    pub fn none() -> Self {
        Self {
            handler: Box::new(|_| {}),
        }
    }

    pub fn fire(self, outcome: T) {
        (self.handler)(outcome)
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}
