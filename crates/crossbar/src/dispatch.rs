use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::debug;

use crate::context::Context;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::plugins::pipeline::{PreHookResult, StreamPipeline};
use crate::queue::WorkItem;
use crate::requests::Request;
use crate::response::{DispatchOutcome, Response, ResponseStream};
use crate::telemetry::{SpanKind, SpanStatus, Tracer};

fn finish(
    response: Option<Box<Response>>,
    error: Option<Box<GatewayError>>,
) -> Result<DispatchOutcome, Box<GatewayError>> {
    match (response, error) {
        (Some(response), None) => Ok(DispatchOutcome::Response(response)),
        (Some(response), Some(error)) if error.is_empty() => {
            Ok(DispatchOutcome::Response(response))
        }
        (_, Some(error)) => Err(error),
        (None, None) => {
            Err(GatewayError::internal("hook pipeline produced neither response nor error").boxed())
        }
    }
}

fn strip_raw_payloads(ctx: &Context, response: &mut Response) {
    if ctx.drop_raw_payloads() {
        response.extra.raw_request = None;
        response.extra.raw_response = None;
    }
}

impl Gateway {
    /// Dispatches a request against its primary target, then walks the
    /// fallback chain. Cancellations and forbid-fallbacks errors pin the
    /// caller to the error in hand; every superseded error is dropped as the
    /// chain advances.
    pub async fn execute(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<DispatchOutcome, Box<GatewayError>> {
        if let Err(mut error) = request.validate() {
            error.attach_request_info(request.kind, &request.provider, &request.model);
            return Err(error.boxed());
        }

        let ctx = ctx.unwrap_or_else(|| self.new_context());
        ctx.ensure_request_id();
        ctx.set_fallback_index(0);

        let mut last = match self.try_request(&ctx, request.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };

        if last.is_cancellation() || last.forbid_fallbacks || request.fallbacks.is_empty() {
            last.attach_request_info(request.kind, &request.provider, &request.model);
            return Err(last);
        }

        for (index, fallback) in request.fallbacks.iter().enumerate() {
            let span = self.tracer.start_span(
                &ctx,
                &format!("fallback.{}.{}", fallback.provider, fallback.model),
                SpanKind::Fallback,
            );
            ctx.set_fallback_index(index as u32 + 1);
            ctx.set_fallback_request_id(Some(uuid::Uuid::new_v4().to_string()));
            debug!(
                provider = %fallback.provider,
                model = %fallback.model,
                "trying fallback"
            );

            match self.try_request(&ctx, request.retargeted(fallback)).await {
                Ok(outcome) => {
                    self.tracer.end_span(span, SpanStatus::Ok, "");
                    drop(last);
                    return Ok(outcome);
                }
                Err(mut error) => {
                    self.tracer.end_span(span, SpanStatus::Error, &error.message);
                    if error.forbid_fallbacks || error.is_cancellation() {
                        drop(last);
                        error.attach_request_info(
                            request.kind,
                            &fallback.provider,
                            &fallback.model,
                        );
                        return Err(error);
                    }
                    last = error;
                }
            }
        }

        last.attach_request_info(request.kind, &request.provider, &request.model);
        Err(last)
    }

    /// One dispatch attempt against one (provider, model) target: resolve
    /// the queue, merge the tool catalog, run pre-hooks, enqueue, await the
    /// result, run post-hooks.
    pub(crate) async fn try_request(
        &self,
        ctx: &Context,
        request: Request,
    ) -> Result<DispatchOutcome, Box<GatewayError>> {
        let queue = self.queue_for(&request.provider).await?;

        let request = match (self.mcp_manager(), request.kind.carries_tools()) {
            (Some(mcp), true) => mcp.merge_tools(ctx, request).await,
            _ => request,
        };

        if ctx.skip_pipeline() {
            let outcome = self.enqueue_and_wait(ctx, &queue, request).await;
            return match outcome {
                Ok(DispatchOutcome::Response(mut response)) => {
                    strip_raw_payloads(ctx, &mut response);
                    Ok(DispatchOutcome::Response(response))
                }
                other => other,
            };
        }

        let mut pipeline = self.pipelines.acquire();
        pipeline.bind(
            self.llm_plugins.load().as_ref().clone(),
            self.mcp_plugins.load().as_ref().clone(),
        );

        let request = match pipeline.run_pre_hooks(ctx, request).await {
            PreHookResult::Continue(request) => request,
            PreHookResult::ShortCircuitResponse(response) => {
                let (response, error) = pipeline
                    .run_post_hooks(ctx, self.tracer.as_ref(), Some(response), None)
                    .await;
                self.pipelines.release(pipeline);
                return finish(response, error);
            }
            PreHookResult::ShortCircuitStream(stream) => {
                // The plugin owns the stream contents; the pipeline moves
                // into the wrapper and is released when that stream closes.
                ctx.set_stream_start_internal(Some(Instant::now()));
                let sp = StreamPipeline::new(
                    self.pipelines.clone(),
                    self.tracer.get(),
                    ctx.clone(),
                    pipeline,
                );
                return Ok(DispatchOutcome::Stream(wrap_short_circuit_stream(stream, sp)));
            }
            PreHookResult::ShortCircuitError(error) => {
                let (response, error) = pipeline
                    .run_post_hooks(ctx, self.tracer.as_ref(), None, Some(error))
                    .await;
                self.pipelines.release(pipeline);
                return finish(response, error);
            }
        };

        match self.enqueue_and_wait(ctx, &queue, request).await {
            Ok(DispatchOutcome::Response(response)) => {
                let (response, error) = pipeline
                    .run_post_hooks(ctx, self.tracer.as_ref(), Some(response), None)
                    .await;
                self.pipelines.release(pipeline);
                match finish(response, error)? {
                    DispatchOutcome::Response(mut response) => {
                        strip_raw_payloads(ctx, &mut response);
                        Ok(DispatchOutcome::Response(response))
                    }
                    outcome => Ok(outcome),
                }
            }
            Ok(DispatchOutcome::Stream(stream)) => {
                // Chunk post-hooks run on the worker's pipeline; this one
                // only carried the pre-hooks.
                self.pipelines.release(pipeline);
                Ok(DispatchOutcome::Stream(stream))
            }
            Err(error) => {
                let (response, error) = pipeline
                    .run_post_hooks(ctx, self.tracer.as_ref(), None, Some(error))
                    .await;
                self.pipelines.release(pipeline);
                finish(response, error)
            }
        }
    }

    async fn enqueue_and_wait(
        &self,
        ctx: &Context,
        queue: &Arc<crate::queue::ProviderQueue>,
        request: Request,
    ) -> Result<DispatchOutcome, Box<GatewayError>> {
        let (item, mut receivers) = WorkItem::new(ctx.clone(), request);
        queue.enqueue(ctx, item, self.drop_excess_requests()).await?;

        let mut stream_rx = receivers.stream_rx;
        tokio::select! {
            Some(response) = receivers.response_rx.recv() => Ok(DispatchOutcome::Response(response)),
            Some(error) = receivers.error_rx.recv() => Err(error),
            Some(stream) = recv_stream(&mut stream_rx) => Ok(DispatchOutcome::Stream(stream)),
            _ = ctx.cancelled() => Err(GatewayError::cancelled().boxed()),
        }
    }
}

async fn recv_stream(
    rx: &mut Option<tokio::sync::mpsc::Receiver<ResponseStream>>,
) -> Option<ResponseStream> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Consumes a plugin-supplied stream, running the per-chunk post-hooks and
/// releasing the pipeline when the stream closes.
fn wrap_short_circuit_stream(raw: ResponseStream, sp: Arc<StreamPipeline>) -> ResponseStream {
    Box::pin(async_stream::stream! {
        let mut raw = raw;
        while let Some(chunk) = raw.next().await {
            let (response, error) = match chunk {
                Ok(response) => (Some(response), None),
                Err(error) => (None, Some(error)),
            };
            let (response, error) = sp.run_chunk_hooks(response, error).await;
            if let Some(error) = error {
                yield Err(error);
            } else if let Some(response) = response {
                yield Ok(response);
            }
        }
        sp.finalize();
    })
}
