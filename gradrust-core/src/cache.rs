use crate::error::GradRustError;
use std::any::Any;

/// Per-invocation scratch store bridging one forward pass to its backward
/// pass.
///
/// Forward steps push the state their backward step will need; backward
/// steps pop it in the exact reverse order (LIFO). A composite function
/// that calls sub-function forwards with the same cache therefore gets a
/// correct unwind for free, as long as its backward calls the sub-function
/// backwards in reverse call order.
///
/// The [`noop`](FunctionCache::noop) variant silently discards writes so
/// that pure-inference forward passes retain no state and perform no extra
/// allocation. Popping from it is an error: a backward pass against a
/// no-op cache means the caller never asked for gradients.
#[derive(Debug, Default)]
pub enum FunctionCache {
    Recording(Vec<Box<dyn Any>>),
    #[default]
    Noop,
}

impl FunctionCache {
    /// Creates a recording cache for a forward/backward round-trip.
    pub fn new() -> Self {
        FunctionCache::Recording(Vec::new())
    }

    /// Creates a cache that discards all writes (forward-only evaluation).
    pub fn noop() -> Self {
        FunctionCache::Noop
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, FunctionCache::Recording(_))
    }

    /// Number of states currently held. Always 0 for a no-op cache.
    pub fn len(&self) -> usize {
        match self {
            FunctionCache::Recording(stack) => stack.len(),
            FunctionCache::Noop => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a forward-pass state onto the stack.
    pub fn push<T: Any>(&mut self, state: T) {
        if let FunctionCache::Recording(stack) = self {
            stack.push(Box::new(state));
        }
    }

    /// Pushes the state produced by `build`, without even invoking `build`
    /// on a no-op cache. Functions use this so that state capture (tensor
    /// clones in particular) is skipped entirely in inference mode.
    pub fn push_with<T: Any, F: FnOnce() -> T>(&mut self, build: F) {
        if let FunctionCache::Recording(stack) = self {
            stack.push(Box::new(build()));
        }
    }

    /// Pops the most recently pushed state, checking its type.
    ///
    /// `operation` names the backward step for error reporting. An empty
    /// stack or a state of the wrong type both mean the forward/backward
    /// call orders diverged, which must surface as an error instead of
    /// silently corrupting another function's state.
    pub fn pop<T: Any>(&mut self, operation: &str) -> Result<T, GradRustError> {
        match self {
            FunctionCache::Recording(stack) => {
                let boxed = stack.pop().ok_or_else(|| GradRustError::CacheExhausted {
                    operation: operation.to_string(),
                })?;
                boxed
                    .downcast::<T>()
                    .map(|state| *state)
                    .map_err(|_| GradRustError::CacheTypeMismatch {
                        operation: operation.to_string(),
                    })
            }
            FunctionCache::Noop => Err(GradRustError::NoopCacheBackward {
                operation: operation.to_string(),
            }),
        }
    }
}
