use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::GatewayError;
use crate::requests::Request;
use crate::response::DispatchOutcome;
use crate::telemetry::{SpanHandle, SpanKind, SpanStatus, Tracer};

/// Exponential backoff for the sleep before attempt `previous + 1`.
pub fn backoff_delay(cfg: &ProviderConfig, previous_attempt: u32) -> Duration {
    let shift = previous_attempt.min(16);
    let ms = cfg
        .retry_backoff_initial_ms
        .saturating_mul(1u64 << shift)
        .min(cfg.retry_backoff_max_ms);
    Duration::from_millis(ms)
}

fn annotate_span(span: &SpanHandle, tracer: &dyn Tracer, ctx: &Context, request: &Request, attempt: u32) {
    tracer.set_attribute(span, "provider", request.provider.to_string());
    tracer.set_attribute(span, "model", request.model.clone());
    tracer.set_attribute(span, "request.kind", request.kind.to_string());
    tracer.set_attribute(span, "retry.count", attempt.to_string());
    tracer.set_attribute(span, "fallback.index", ctx.fallback_index().to_string());
    if let Some(key_id) = ctx.selected_key_id() {
        tracer.set_attribute(span, "key.id", key_id);
    }
    if let Some(key_name) = ctx.selected_key_name() {
        tracer.set_attribute(span, "key.name", key_name);
    }
    for (key, value) in ctx.governance() {
        tracer.set_attribute(span, &format!("governance.{key}"), value);
    }
}

/// Runs the handler with the provider's retry policy.
///
/// Each attempt gets its own span. A stream result parks its span in the
/// tracer's deferred table, keyed by trace id, so the stream closer can end
/// it once the last chunk is through. Non-retryable failures and exhausted
/// budgets surface the last error; each superseded error is dropped before
/// the next attempt.
pub async fn execute_with_retries<F, Fut>(
    ctx: &Context,
    cfg: &ProviderConfig,
    tracer: &dyn Tracer,
    request: &Request,
    handler: F,
) -> Result<DispatchOutcome, Box<GatewayError>>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<DispatchOutcome, Box<GatewayError>>>,
{
    let trace_id = ctx.ensure_trace_id();
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            if ctx.is_cancelled() {
                return Err(GatewayError::cancelled().boxed());
            }
            let delay = backoff_delay(cfg, attempt - 1);
            debug!(attempt, ?delay, provider = %request.provider, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }

        let (name, kind) = if attempt == 0 {
            ("llm.call".to_string(), SpanKind::LlmCall)
        } else {
            (format!("retry.attempt.{attempt}"), SpanKind::Retry)
        };
        let span = tracer.start_span(ctx, &name, kind);
        annotate_span(&span, tracer, ctx, request, attempt);
        tracer.record_request(&span, request);

        if request.kind.is_streaming() {
            ctx.set_stream_start_internal(Some(Instant::now()));
        }

        let started = Instant::now();
        match handler(attempt).await {
            Ok(DispatchOutcome::Stream(stream)) => {
                tracer.store_deferred_span(&trace_id, span);
                return Ok(DispatchOutcome::Stream(stream));
            }
            Ok(DispatchOutcome::Response(mut response)) => {
                response
                    .extra
                    .latency_ms
                    .get_or_insert(started.elapsed().as_millis() as u64);
                tracer.record_response(&span, Some(&response), None);
                tracer.end_span(span, SpanStatus::Ok, "");
                return Ok(DispatchOutcome::Response(response));
            }
            Err(error) => {
                tracer.record_response(&span, None, Some(&error));
                tracer.end_span(span, SpanStatus::Error, &error.message);
                if !error.is_retryable() || attempt >= cfg.max_retries {
                    return Err(error);
                }
                warn!(
                    attempt,
                    provider = %request.provider,
                    error = %error.message,
                    "retryable failure"
                );
                attempt += 1;
            }
        }
    }
}
