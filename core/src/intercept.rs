//! Call interception through the dispatch registry.
//!
//! A caller holding the original handler (or a service object whose method
//! was declared retryable) routes the call here instead of calling it
//! directly; the interceptor finds the retry-capable wrapper by identity.
//! No entry means the call is not intercepted: `None`, never an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::capture::FailureCapture;
use crate::handler::{MethodHandler, RetryHandler};
use crate::registry::DispatchRegistry;

/// Interceptor for types that implement [`RetryHandler`] themselves.
#[derive(Clone)]
pub struct HandlerClassInterceptor {
    registry: DispatchRegistry,
}

impl HandlerClassInterceptor {
    /// Interceptor reading `registry`.
    pub fn new(registry: DispatchRegistry) -> Self {
        Self { registry }
    }

    /// Invoke the live wrapper registered for `target`'s identity.
    pub fn intercept<H: RetryHandler>(&self, target: &H, arg: &H::Arg) -> Option<anyhow::Result<H::Output>> {
        let identity = target.identity().trim();
        match self.registry.lookup::<FailureCapture<H>>(identity) {
            Some(live) => Some(live.invoke(arg)),
            None => {
                debug!(identity, "no retry handler registered, call passed over");
                None
            }
        }
    }
}

/// Interceptor for retry functions (methods bound with [`MethodHandler`]).
#[derive(Clone)]
pub struct RetryFunctionInterceptor {
    registry: DispatchRegistry,
}

impl RetryFunctionInterceptor {
    /// Interceptor reading `registry`.
    pub fn new(registry: DispatchRegistry) -> Self {
        Self { registry }
    }

    /// Invoke the live wrapper of the retry function registered as `identity`
    /// with receiver type `T`.
    pub fn intercept<T, A, R>(&self, identity: &str, arg: &A) -> Option<anyhow::Result<R>>
    where
        T: Send + Sync + 'static,
        A: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Send + 'static,
    {
        let identity = identity.trim();
        match self.registry.lookup::<FailureCapture<MethodHandler<T, A, R>>>(identity) {
            Some(live) => Some(live.invoke(arg)),
            None => {
                debug!(identity, "no retry function registered, call passed over");
                None
            }
        }
    }
}
