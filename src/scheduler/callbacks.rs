//! Statically resolvable callbacks.
//!
//! Queued jobs may outlive the process that queued them, so a callback is
//! never a closure. Producers register plain functions under a
//! `(handler, method)` name once, and the scheduler stores only the
//! [`CallbackRef`]. The registry resolves it back to the function pointer at
//! invocation time.

use std::collections::HashMap;
use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PoolError, Result};
use crate::scheduler::job::JobResult;
use crate::scheduler::BrowserPool;
use crate::worker::Worker;

/// Serializable name of a registered callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackRef {
    pub handler: String,
    pub method: String,
}

impl CallbackRef {
    pub fn new(handler: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.handler, self.method)
    }
}

/// Everything a result callback gets invoked with.
pub struct Delivery {
    pub result: JobResult,
    /// The job's caller payload
    pub args: Vec<Value>,
    /// The scheduler that ran the job
    pub pool: BrowserPool,
}

/// Receives the results of exploration, trace and event-trigger jobs.
pub type ResultHandler = fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>>;

/// Receives a leased worker for browser-provider jobs.
pub type BrowserHandler =
    for<'a> fn(&'a mut Worker, Vec<Value>) -> BoxFuture<'a, anyhow::Result<()>>;

#[derive(Clone, Copy)]
pub enum Handler {
    Result(ResultHandler),
    Browser(BrowserHandler),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Result(_) => HandlerKind::Result,
            Handler::Browser(_) => HandlerKind::Browser,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Result,
    Browser,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Result => write!(f, "result handler"),
            HandlerKind::Browser => write!(f, "browser handler"),
        }
    }
}

/// Dispatch table from callback names to functions.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<CallbackRef, Handler>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_result(
        &mut self,
        handler: &str,
        method: &str,
        callback: ResultHandler,
    ) -> CallbackRef {
        self.register(CallbackRef::new(handler, method), Handler::Result(callback))
    }

    pub fn register_browser(
        &mut self,
        handler: &str,
        method: &str,
        callback: BrowserHandler,
    ) -> CallbackRef {
        self.register(CallbackRef::new(handler, method), Handler::Browser(callback))
    }

    fn register(&mut self, callback: CallbackRef, handler: Handler) -> CallbackRef {
        if self.handlers.insert(callback.clone(), handler).is_some() {
            tracing::warn!(callback = %callback, "Callback registered twice, keeping the latest");
        }
        callback
    }

    pub fn resolve(&self, callback: &CallbackRef) -> Option<Handler> {
        self.handlers.get(callback).copied()
    }

    /// Resolves `callback` and checks it is of the `expected` kind.
    pub fn resolve_as(&self, callback: &CallbackRef, expected: HandlerKind) -> Result<Handler> {
        let handler = self
            .resolve(callback)
            .ok_or_else(|| PoolError::UnknownCallback(callback.clone()))?;

        if handler.kind() != expected {
            return Err(kind_mismatch(callback, expected));
        }
        Ok(handler)
    }

    pub fn resolve_result(&self, callback: &CallbackRef) -> Result<ResultHandler> {
        match self.resolve_as(callback, HandlerKind::Result)? {
            Handler::Result(f) => Ok(f),
            Handler::Browser(_) => Err(kind_mismatch(callback, HandlerKind::Result)),
        }
    }

    pub fn resolve_browser(&self, callback: &CallbackRef) -> Result<BrowserHandler> {
        match self.resolve_as(callback, HandlerKind::Browser)? {
            Handler::Browser(f) => Ok(f),
            Handler::Result(_) => Err(kind_mismatch(callback, HandlerKind::Browser)),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn kind_mismatch(callback: &CallbackRef, expected: HandlerKind) -> PoolError {
    let found = match expected {
        HandlerKind::Result => HandlerKind::Browser,
        HandlerKind::Browser => HandlerKind::Result,
    };
    PoolError::CallbackKind {
        callback: callback.clone(),
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn on_result(_: Delivery) -> BoxFuture<'static, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn on_browser(_: &mut Worker, _: Vec<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    #[test]
    fn resolves_registered_callbacks() {
        let mut registry = CallbackRegistry::new();
        let result = registry.register_result("Crawler", "on_page", on_result);
        let browser = registry.register_browser("Crawler", "with_browser", on_browser);

        assert_eq!(result.to_string(), "Crawler::on_page");
        assert_eq!(registry.len(), 2);
        assert!(matches!(registry.resolve(&result), Some(Handler::Result(_))));
        assert!(matches!(registry.resolve(&browser), Some(Handler::Browser(_))));
    }

    #[test]
    fn rejects_unknown_and_mismatched_callbacks() {
        let mut registry = CallbackRegistry::new();
        let result = registry.register_result("Crawler", "on_page", on_result);

        let err = registry
            .resolve_as(&CallbackRef::new("Crawler", "missing"), HandlerKind::Result)
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownCallback(_)));

        let err = registry
            .resolve_as(&result, HandlerKind::Browser)
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::CallbackKind {
                expected: HandlerKind::Browser,
                found: HandlerKind::Result,
                ..
            }
        ));
    }
}
