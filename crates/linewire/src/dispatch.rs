//! Request dispatch: decode, resolve, invoke, terminal reply.
//!
//! Per request the lifecycle is received → dispatched → (progress)* →
//! terminal. Every path through [`Dispatcher::dispatch_line`] ends in exactly
//! one terminal reply, except a line whose correlation id cannot be recovered
//! at all; that one gets a best-effort error envelope without an id. Nothing
//! a handler does can crash the worker loop.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::codec::decode_request;
use crate::emitter::{ReplyEmitter, RequestContext};
use crate::protocol::ErrorCode;
use crate::registry::HandlerRegistry;

pub(crate) struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    emitter: ReplyEmitter,
    expose_error_detail: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        emitter: ReplyEmitter,
        expose_error_detail: bool,
    ) -> Self {
        Self {
            registry,
            emitter,
            expose_error_detail,
        }
    }

    pub(crate) async fn dispatch_line(&self, line: String) {
        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(malformed) => {
                tracing::debug!(error = %malformed, "rejecting malformed line");
                let detail = self.detail(&malformed.reason);
                let _ = self
                    .emitter
                    .protocol_error(malformed.id, ErrorCode::MalformedMessage, detail);
                return;
            }
        };

        let handler = match self.registry.resolve(&request.method) {
            Ok(handler) => handler,
            Err(unknown) => {
                tracing::debug!(method = %request.method, id = %request.id, "no handler registered");
                let detail = self.detail(&unknown.to_string());
                let _ = self.emitter.protocol_error(
                    Some(request.id),
                    ErrorCode::MethodNotFound,
                    detail,
                );
                return;
            }
        };

        let id = request.id.clone();
        let ctx = RequestContext::new(request.id, request.params, self.emitter.clone());

        // The inner spawn isolates handler panics: they surface here as a
        // JoinError instead of unwinding through the dispatch task. The guard
        // ties the handler's lifetime to ours, so an abandoned dispatch does
        // not leave the handler running detached.
        let handle = tokio::spawn(async move { handler.call(ctx).await });
        let _abort_guard = AbortOnDrop(handle.abort_handle());
        let outcome = handle.await;

        match outcome {
            Ok(Ok(data)) => {
                let _ = self.emitter.response(id, data);
            }
            Ok(Err(err)) => {
                tracing::warn!(id = %id, error = %err, "handler failed");
                let detail = self.detail(&format!("{err:#}"));
                let _ = self
                    .emitter
                    .protocol_error(Some(id), ErrorCode::HandlerFailed, detail);
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "handler panicked"
                } else {
                    "handler task was cancelled"
                };
                tracing::error!(id = %id, reason, "handler crashed");
                let _ = self.emitter.protocol_error(
                    Some(id),
                    ErrorCode::HandlerFailed,
                    self.detail(reason),
                );
            }
        }
    }

    // Diagnostic context reaches the parent only when disclosure is enabled,
    // and even then as a message, never a backtrace.
    fn detail(&self, message: &str) -> Value {
        if self.expose_error_detail {
            json!({ "detail": message })
        } else {
            Value::Null
        }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
