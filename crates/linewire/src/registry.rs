//! Handler registration and lookup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::emitter::RequestContext;

/// A registered method implementation.
///
/// `Ok(value)` becomes the `data` of the terminal response. `Err` is an
/// unexpected failure and is turned into a protocol error reply by the
/// dispatcher; handlers that want to report an application-level failure
/// encode it in the value they return instead.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: RequestContext) -> anyhow::Result<Value>;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Method-name-to-handler table.
///
/// Populated before the worker loop starts and read-only while it runs. Pass
/// one registry per [`Worker`](crate::Worker); nothing here is global, so
/// independent workers can coexist in one process.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name. Last registration wins.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(method, Arc::new(FnHandler(handler)));
    }

    /// Look up the handler for a method. Names match exactly; there is no
    /// pattern matching.
    pub fn resolve(&self, method: &str) -> Result<Arc<dyn Handler>, UnknownMethod> {
        self.handlers
            .get(method)
            .cloned()
            .ok_or_else(|| UnknownMethod {
                method: method.to_string(),
            })
    }
}

/// No handler registered under the requested method name.
#[derive(Debug, thiserror::Error)]
#[error("no handler registered for method `{method}`")]
pub struct UnknownMethod {
    pub method: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::ReplyEmitter;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_ctx(id: &str, params: Value) -> RequestContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        RequestContext::new(id.to_string(), params, ReplyEmitter::new(tx))
    }

    #[tokio::test]
    async fn register_fn_and_call() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |ctx| async move { Ok(ctx.params().clone()) });

        let handler = registry.resolve("echo").unwrap();
        let result = handler.call(test_ctx("1", json!({"x": 1}))).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("greet", |_ctx| async { Ok(json!("first")) });
        registry.register_fn("greet", |_ctx| async { Ok(json!("second")) });

        let handler = registry.resolve("greet").unwrap();
        let result = handler.call(test_ctx("1", Value::Null)).await.unwrap();
        assert_eq!(result, json!("second"));
    }

    #[test]
    fn resolve_unknown_method_fails() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert_eq!(err.method, "missing");
    }

    #[test]
    fn method_names_match_exactly() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("pipeline.run", |_ctx| async { Ok(Value::Null) });

        assert!(registry.resolve("pipeline.run").is_ok());
        assert!(registry.resolve("pipeline").is_err());
        assert!(registry.resolve("pipeline.Run").is_err());
    }
}
