use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::context::Context;
use crate::error::GatewayError;
use crate::requests::Request;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    LlmCall,
    Retry,
    Fallback,
    Plugin,
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::LlmCall => "llm_call",
            SpanKind::Retry => "retry",
            SpanKind::Fallback => "fallback",
            SpanKind::Plugin => "plugin",
            SpanKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// An open span. Handles are concrete so tracer implementations share the
/// attribute plumbing and differ only in what happens on `end_span`.
pub struct SpanHandle {
    pub id: String,
    pub name: String,
    pub kind: SpanKind,
    pub started: Instant,
    attributes: Mutex<Vec<(String, String)>>,
}

impl SpanHandle {
    fn new(name: &str, kind: SpanKind) -> Self {
        SpanHandle {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            started: Instant::now(),
            attributes: Mutex::new(Vec::new()),
        }
    }

    pub fn push_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((key.into(), value.into()));
    }

    pub fn attributes(&self) -> Vec<(String, String)> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Span sink consumed by the dispatcher. A no-op implementation satisfies
/// every method; richer backends can bridge to any exporter.
pub trait Tracer: Send + Sync {
    /// Opens a span and records its id in the context.
    fn start_span(&self, ctx: &Context, name: &str, kind: SpanKind) -> SpanHandle {
        let handle = SpanHandle::new(name, kind);
        ctx.ensure_trace_id();
        ctx.set_span_id_internal(Some(handle.id.clone()));
        handle
    }

    fn set_attribute(&self, span: &SpanHandle, key: &str, value: String) {
        span.push_attribute(key, value);
    }

    fn end_span(&self, span: SpanHandle, status: SpanStatus, message: &str);

    /// Stamps the request shape (message count, tool choice, parameters) on
    /// a call span.
    fn record_request(&self, span: &SpanHandle, request: &Request) {
        self.set_attribute(span, "request.kind", request.kind.to_string());
        self.set_attribute(span, "request.model", request.model.clone());
        if let Some(tools) = request.payload.tools() {
            self.set_attribute(span, "request.tool_count", tools.len().to_string());
        }
        if let crate::requests::RequestPayload::Chat(chat) = &request.payload {
            self.set_attribute(span, "request.message_count", chat.messages.len().to_string());
        }
        if let Some(params) = &request.params {
            self.set_attribute(span, "request.params", params.to_string());
        }
    }

    fn record_response(
        &self,
        span: &SpanHandle,
        response: Option<&Response>,
        error: Option<&GatewayError>,
    ) {
        if let Some(response) = response {
            self.set_attribute(span, "response.id", response.id.clone());
            self.set_attribute(span, "response.model", response.model.clone());
            if let Some(usage) = &response.usage {
                self.set_attribute(span, "response.total_tokens", usage.total_tokens.to_string());
            }
        }
        if let Some(error) = error {
            self.set_attribute(span, "error.message", error.message.clone());
            if let Some(code) = error.status_code {
                self.set_attribute(span, "error.status_code", code.to_string());
            }
        }
    }

    /// Parks a span so the component that closes a stream can end it.
    fn store_deferred_span(&self, trace_id: &str, span: SpanHandle);

    fn take_deferred_span(&self, trace_id: &str) -> Option<SpanHandle>;

    fn stop(&self);
}

/// Discards every span.
#[derive(Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn end_span(&self, _span: SpanHandle, _status: SpanStatus, _message: &str) {}

    fn store_deferred_span(&self, _trace_id: &str, _span: SpanHandle) {}

    fn take_deferred_span(&self, _trace_id: &str) -> Option<SpanHandle> {
        None
    }

    fn stop(&self) {}
}

/// Emits one structured `tracing` event per finished span.
#[derive(Default)]
pub struct LogTracer {
    deferred: DashMap<String, SpanHandle>,
}

impl Tracer for LogTracer {
    fn end_span(&self, span: SpanHandle, status: SpanStatus, message: &str) {
        let attributes = span
            .attributes()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            span = %span.name,
            kind = span.kind.as_str(),
            status = ?status,
            duration_ms = span.started.elapsed().as_millis() as u64,
            detail = message,
            %attributes,
            "span finished"
        );
    }

    fn store_deferred_span(&self, trace_id: &str, span: SpanHandle) {
        self.deferred.insert(trace_id.to_string(), span);
    }

    fn take_deferred_span(&self, trace_id: &str) -> Option<SpanHandle> {
        self.deferred.remove(trace_id).map(|(_, span)| span)
    }

    fn stop(&self) {
        self.deferred.clear();
    }
}

/// Runtime-swappable tracer holder. Workers and the dispatcher hold this
/// through `Arc<dyn Tracer>`, so replacing the tracer takes effect for every
/// component immediately.
pub(crate) struct TracerSlot {
    inner: std::sync::RwLock<Arc<dyn Tracer>>,
}

impl TracerSlot {
    pub(crate) fn new(tracer: Arc<dyn Tracer>) -> Self {
        TracerSlot {
            inner: std::sync::RwLock::new(tracer),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn Tracer> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set(&self, tracer: Arc<dyn Tracer>) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tracer;
    }
}

impl Tracer for TracerSlot {
    fn start_span(&self, ctx: &Context, name: &str, kind: SpanKind) -> SpanHandle {
        self.get().start_span(ctx, name, kind)
    }

    fn set_attribute(&self, span: &SpanHandle, key: &str, value: String) {
        self.get().set_attribute(span, key, value)
    }

    fn end_span(&self, span: SpanHandle, status: SpanStatus, message: &str) {
        self.get().end_span(span, status, message)
    }

    fn record_request(&self, span: &SpanHandle, request: &Request) {
        self.get().record_request(span, request)
    }

    fn record_response(
        &self,
        span: &SpanHandle,
        response: Option<&Response>,
        error: Option<&GatewayError>,
    ) {
        self.get().record_response(span, response, error)
    }

    fn store_deferred_span(&self, trace_id: &str, span: SpanHandle) {
        self.get().store_deferred_span(trace_id, span)
    }

    fn take_deferred_span(&self, trace_id: &str) -> Option<SpanHandle> {
        self.get().take_deferred_span(trace_id)
    }

    fn stop(&self) {
        self.get().stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_span_records_ids_in_context() {
        let tracer = LogTracer::default();
        let ctx = Context::new();
        let span = tracer.start_span(&ctx, "llm.call", SpanKind::LlmCall);
        assert_eq!(ctx.span_id().as_deref(), Some(span.id.as_str()));
        assert!(ctx.trace_id().is_some());
        tracer.end_span(span, SpanStatus::Ok, "");
    }

    #[test]
    fn deferred_spans_round_trip() {
        let tracer = LogTracer::default();
        let ctx = Context::new();
        let span = tracer.start_span(&ctx, "llm.call", SpanKind::LlmCall);
        tracer.store_deferred_span("trace-1", span);
        assert!(tracer.take_deferred_span("trace-1").is_some());
        assert!(tracer.take_deferred_span("trace-1").is_none());
    }
}
