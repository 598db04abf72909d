use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::warn;

use crate::context::Context;
use crate::error::GatewayError;
use crate::mcp::ToolInvocation;
use crate::plugins::{McpPlugin, McpPreDecision, Plugin, PreHookDecision};
use crate::pool::{Pool, Reusable};
use crate::requests::{ChatMessage, Request};
use crate::response::{Response, ResponseStream};
use crate::telemetry::{SpanKind, SpanStatus, Tracer};

/// Outcome of running the LLM pre-hook chain.
pub enum PreHookResult {
    Continue(Request),
    ShortCircuitResponse(Box<Response>),
    ShortCircuitStream(ResponseStream),
    ShortCircuitError(Box<GatewayError>),
}

/// Outcome of running the MCP pre-hook chain.
pub enum McpPreResult {
    Continue(ToolInvocation),
    ShortCircuitResult(ChatMessage),
    ShortCircuitError(Box<GatewayError>),
}

/// Per-plugin accumulation while a stream is in flight, so chunks do not
/// create one span per plugin each.
#[derive(Debug, Clone, Default)]
pub struct HookStreamStats {
    pub total: Duration,
    pub invocations: u64,
    pub errors: u64,
}

/// Pooled holder of the LLM and MCP hook chains for one call.
///
/// Tracks how many pre-hooks ran so post-hooks can walk exactly that prefix
/// in reverse, and accumulates per-plugin streaming statistics keyed by
/// first-seen order.
#[derive(Default)]
pub struct PluginPipeline {
    llm_plugins: Vec<Arc<dyn Plugin>>,
    mcp_plugins: Vec<Arc<dyn McpPlugin>>,
    executed_pre: usize,
    executed_mcp_pre: usize,
    hook_errors: Vec<String>,
    stream_stats: IndexMap<String, HookStreamStats>,
    chunk_count: u64,
}

impl Reusable for PluginPipeline {
    fn reset(&mut self) {
        self.llm_plugins.clear();
        self.mcp_plugins.clear();
        self.executed_pre = 0;
        self.executed_mcp_pre = 0;
        self.hook_errors.clear();
        self.stream_stats.clear();
        self.chunk_count = 0;
    }
}

impl PluginPipeline {
    /// Binds the active plugin snapshots for this call.
    pub fn bind(&mut self, llm: Vec<Arc<dyn Plugin>>, mcp: Vec<Arc<dyn McpPlugin>>) {
        self.llm_plugins = llm;
        self.mcp_plugins = mcp;
    }

    /// For worker-side streaming pipelines: every plugin's post-hook runs per
    /// chunk, so the executed prefix is the whole chain.
    pub fn mark_all_pre_executed(&mut self) {
        self.executed_pre = self.llm_plugins.len();
    }

    pub fn executed_pre(&self) -> usize {
        self.executed_pre
    }

    pub fn hook_errors(&self) -> &[String] {
        &self.hook_errors
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn stream_stats(&self) -> &IndexMap<String, HookStreamStats> {
        &self.stream_stats
    }

    /// Runs LLM pre-hooks in registration order. Short-circuit stops the
    /// chain; the short-circuiting plugin still counts toward the executed
    /// prefix so its post-hook runs.
    pub async fn run_pre_hooks(&mut self, ctx: &Context, request: Request) -> PreHookResult {
        ctx.block_reserved_writes(true);
        let mut current = request;
        let plugins = self.llm_plugins.clone();
        for (index, plugin) in plugins.iter().enumerate() {
            self.executed_pre = index + 1;
            match plugin.pre_hook(ctx, current).await {
                Ok(PreHookDecision::Continue(request)) => current = request,
                Ok(PreHookDecision::Respond(response)) => {
                    ctx.block_reserved_writes(false);
                    return PreHookResult::ShortCircuitResponse(response);
                }
                Ok(PreHookDecision::Stream(stream)) => {
                    ctx.block_reserved_writes(false);
                    return PreHookResult::ShortCircuitStream(stream);
                }
                Ok(PreHookDecision::Fail(error)) => {
                    ctx.block_reserved_writes(false);
                    return PreHookResult::ShortCircuitError(error);
                }
                Err(error) => {
                    self.hook_errors
                        .push(format!("{}: {}", plugin.name(), error.message));
                    ctx.block_reserved_writes(false);
                    return PreHookResult::ShortCircuitError(hook_failure(*error, plugin.name()));
                }
            }
        }
        ctx.block_reserved_writes(false);
        PreHookResult::Continue(current)
    }

    /// Runs post-hooks over the executed prefix in reverse.
    ///
    /// An empty error next to a response is treated as a recovery and
    /// cleared. If a non-empty error and a response both survive the chain,
    /// the error wins and the response is dropped.
    pub async fn run_post_hooks(
        &mut self,
        ctx: &Context,
        tracer: &dyn Tracer,
        response: Option<Box<Response>>,
        error: Option<Box<GatewayError>>,
    ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
        let streaming = ctx.stream_start().is_some();
        ctx.block_reserved_writes(true);

        let mut response = response;
        let mut error = error;
        let plugins = self.llm_plugins.clone();
        for index in (0..self.executed_pre.min(plugins.len())).rev() {
            let plugin = &plugins[index];
            let saw_error = error.is_some();
            let start = Instant::now();
            let (next_response, next_error) = plugin.post_hook(ctx, response, error).await;
            let elapsed = start.elapsed();
            response = next_response;
            error = next_error;

            if response.is_some() && error.as_ref().is_some_and(|e| e.is_empty()) {
                error = None;
            }

            if streaming {
                let stats = self.stream_stats.entry(plugin.name().to_string()).or_default();
                stats.total += elapsed;
                stats.invocations += 1;
                if saw_error || error.is_some() {
                    stats.errors += 1;
                }
            } else {
                let span =
                    tracer.start_span(ctx, &format!("plugin.{}", plugin.name()), SpanKind::Plugin);
                tracer.set_attribute(&span, "hook.duration_ms", elapsed.as_millis().to_string());
                let status = if error.is_some() {
                    SpanStatus::Error
                } else {
                    SpanStatus::Ok
                };
                tracer.end_span(span, status, "");
            }
        }

        if streaming {
            self.chunk_count += 1;
        }
        ctx.block_reserved_writes(false);

        if let Some(err) = &error {
            if !err.is_empty() && response.is_some() {
                response = None;
            }
        }
        (response, error)
    }

    pub async fn run_mcp_pre_hooks(
        &mut self,
        ctx: &Context,
        invocation: ToolInvocation,
    ) -> McpPreResult {
        ctx.block_reserved_writes(true);
        let mut current = invocation;
        let plugins = self.mcp_plugins.clone();
        for (index, plugin) in plugins.iter().enumerate() {
            self.executed_mcp_pre = index + 1;
            match plugin.pre_tool_hook(ctx, current).await {
                Ok(McpPreDecision::Continue(invocation)) => current = invocation,
                Ok(McpPreDecision::Respond(message)) => {
                    ctx.block_reserved_writes(false);
                    return McpPreResult::ShortCircuitResult(message);
                }
                Ok(McpPreDecision::Fail(error)) => {
                    ctx.block_reserved_writes(false);
                    return McpPreResult::ShortCircuitError(error);
                }
                Err(error) => {
                    self.hook_errors
                        .push(format!("{}: {}", plugin.name(), error.message));
                    ctx.block_reserved_writes(false);
                    return McpPreResult::ShortCircuitError(hook_failure(*error, plugin.name()));
                }
            }
        }
        ctx.block_reserved_writes(false);
        McpPreResult::Continue(current)
    }

    pub async fn run_mcp_post_hooks(
        &mut self,
        ctx: &Context,
        result: Option<ChatMessage>,
        error: Option<Box<GatewayError>>,
    ) -> (Option<ChatMessage>, Option<Box<GatewayError>>) {
        ctx.block_reserved_writes(true);
        let mut result = result;
        let mut error = error;
        let plugins = self.mcp_plugins.clone();
        for index in (0..self.executed_mcp_pre.min(plugins.len())).rev() {
            let (next_result, next_error) = plugins[index].post_tool_hook(ctx, result, error).await;
            result = next_result;
            error = next_error;
            if result.is_some() && error.as_ref().is_some_and(|e| e.is_empty()) {
                error = None;
            }
        }
        ctx.block_reserved_writes(false);
        (result, error)
    }

    /// One finalize step at stream end: a nested span chain mirroring the
    /// pre-hook hierarchy, each span carrying that plugin's aggregate
    /// statistics, ended innermost first.
    pub fn finalize_stream_spans(&mut self, ctx: &Context, tracer: &dyn Tracer) {
        if self.stream_stats.is_empty() {
            return;
        }
        let mut open = Vec::with_capacity(self.stream_stats.len());
        for (name, stats) in &self.stream_stats {
            let span = tracer.start_span(ctx, &format!("plugin.{name}"), SpanKind::Plugin);
            tracer.set_attribute(&span, "stream.invocations", stats.invocations.to_string());
            tracer.set_attribute(&span, "stream.errors", stats.errors.to_string());
            tracer.set_attribute(&span, "stream.total_ms", stats.total.as_millis().to_string());
            let avg_ms = if stats.invocations > 0 {
                stats.total.as_millis() as u64 / stats.invocations
            } else {
                0
            };
            tracer.set_attribute(&span, "stream.avg_ms", avg_ms.to_string());
            tracer.set_attribute(&span, "stream.chunks", self.chunk_count.to_string());
            open.push(span);
        }
        while let Some(span) = open.pop() {
            tracer.end_span(span, SpanStatus::Ok, "");
        }
    }
}

fn hook_failure(mut error: GatewayError, plugin: &str) -> Box<GatewayError> {
    error.is_internal = true;
    if error.error_type.is_none() {
        error.error_type = Some(crate::error::ErrorType::Hook);
    }
    error.message = format!("plugin {plugin}: {}", error.message);
    Box::new(error)
}

/// Shared holder for a pipeline that outlives the worker turn because a
/// stream is in flight. Three parties may want to put the pipeline back in
/// the pool: the worker's error path, the stream-end finalizer, and the
/// never-delivered safety net. The `released` flag makes whichever arrives
/// first the only one that does it.
pub struct StreamPipeline {
    slot: tokio::sync::Mutex<Option<PluginPipeline>>,
    released: AtomicBool,
    pool: Arc<Pool<PluginPipeline>>,
    tracer: Arc<dyn Tracer>,
    ctx: Context,
}

impl StreamPipeline {
    pub fn new(
        pool: Arc<Pool<PluginPipeline>>,
        tracer: Arc<dyn Tracer>,
        ctx: Context,
        pipeline: PluginPipeline,
    ) -> Arc<Self> {
        Arc::new(StreamPipeline {
            slot: tokio::sync::Mutex::new(Some(pipeline)),
            released: AtomicBool::new(false),
            pool,
            tracer,
            ctx,
        })
    }

    /// Runs post-hooks for one chunk. After release this is a pass-through.
    pub async fn run_chunk_hooks(
        &self,
        response: Option<Box<Response>>,
        error: Option<Box<GatewayError>>,
    ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(pipeline) => {
                pipeline
                    .run_post_hooks(&self.ctx, self.tracer.as_ref(), response, error)
                    .await
            }
            None => (response, error),
        }
    }

    /// Stream-end finalization: aggregate plugin spans, then release.
    pub fn finalize(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.slot.try_lock() {
            Ok(mut slot) => {
                if let Some(mut pipeline) = slot.take() {
                    pipeline.finalize_stream_spans(&self.ctx, self.tracer.as_ref());
                    self.pool.release(pipeline);
                }
            }
            Err(_) => warn!("stream pipeline busy during finalize; dropping without spans"),
        }
    }

    /// Releases without emitting spans, for error paths where the stream
    /// never happened.
    pub fn release_quiet(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(pipeline) = slot.take() {
                self.pool.release(pipeline);
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Some(pipeline) = self.slot.get_mut().take() {
            self.pool.release(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use crate::requests::{ChatMessage, ProviderId};
    use crate::telemetry::NoopTracer;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingPlugin {
        label: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        pre: Option<fn(Request) -> PreHookDecision>,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            self.label
        }

        async fn pre_hook(
            &self,
            _ctx: &Context,
            request: Request,
        ) -> Result<PreHookDecision, Box<GatewayError>> {
            self.log.lock().unwrap().push(format!("pre:{}", self.label));
            match self.pre {
                Some(f) => Ok(f(request)),
                None => Ok(PreHookDecision::Continue(request)),
            }
        }

        async fn post_hook(
            &self,
            _ctx: &Context,
            response: Option<Box<Response>>,
            error: Option<Box<GatewayError>>,
        ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
            self.log.lock().unwrap().push(format!("post:{}", self.label));
            (response, error)
        }
    }

    fn plugin(
        label: &'static str,
        log: &Arc<StdMutex<Vec<String>>>,
        pre: Option<fn(Request) -> PreHookDecision>,
    ) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin {
            label,
            log: log.clone(),
            pre,
        })
    }

    fn chat_request() -> Request {
        Request::chat(ProviderId::OpenAi, "gpt-4o", vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn post_hooks_run_in_reverse_registration_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = PluginPipeline::default();
        pipeline.bind(
            vec![plugin("a", &log, None), plugin("b", &log, None), plugin("c", &log, None)],
            vec![],
        );

        let ctx = Context::new();
        let result = pipeline.run_pre_hooks(&ctx, chat_request()).await;
        assert!(matches!(result, PreHookResult::Continue(_)));

        pipeline
            .run_post_hooks(&ctx, &NoopTracer, Some(Response::chat("m", ChatMessage::assistant("ok")).boxed()), None)
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre:a", "pre:b", "pre:c", "post:c", "post:b", "post:a"]
        );
    }

    #[tokio::test]
    async fn short_circuit_limits_post_hooks_to_executed_prefix() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = PluginPipeline::default();
        pipeline.bind(
            vec![
                plugin("a", &log, None),
                plugin("b", &log, Some(|_req| {
                    PreHookDecision::Respond(
                        Response::chat("m", ChatMessage::assistant("cached")).boxed(),
                    )
                })),
                plugin("c", &log, None),
            ],
            vec![],
        );

        let ctx = Context::new();
        let result = pipeline.run_pre_hooks(&ctx, chat_request()).await;
        let PreHookResult::ShortCircuitResponse(response) = result else {
            panic!("expected response short-circuit");
        };
        pipeline
            .run_post_hooks(&ctx, &NoopTracer, Some(response), None)
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["pre:a", "pre:b", "post:b", "post:a"]);
    }

    #[tokio::test]
    async fn hook_failure_becomes_internal_error() {
        struct Failing;
        #[async_trait]
        impl Plugin for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            async fn pre_hook(
                &self,
                _ctx: &Context,
                _request: Request,
            ) -> Result<PreHookDecision, Box<GatewayError>> {
                Err(GatewayError::provider(500, "boom").boxed())
            }
        }

        let mut pipeline = PluginPipeline::default();
        pipeline.bind(vec![Arc::new(Failing)], vec![]);
        let result = pipeline.run_pre_hooks(&Context::new(), chat_request()).await;
        let PreHookResult::ShortCircuitError(error) = result else {
            panic!("expected error short-circuit");
        };
        assert!(error.is_internal);
        assert!(error.message.contains("failing"));
        assert_eq!(pipeline.hook_errors().len(), 1);
    }

    #[tokio::test]
    async fn empty_error_beside_response_is_recovery() {
        struct Recovering;
        #[async_trait]
        impl Plugin for Recovering {
            fn name(&self) -> &str {
                "recovering"
            }
            async fn post_hook(
                &self,
                _ctx: &Context,
                _response: Option<Box<Response>>,
                _error: Option<Box<GatewayError>>,
            ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
                (
                    Some(Response::chat("m", ChatMessage::assistant("recovered")).boxed()),
                    Some(GatewayError::empty().boxed()),
                )
            }
        }

        let mut pipeline = PluginPipeline::default();
        pipeline.bind(vec![Arc::new(Recovering)], vec![]);
        let ctx = Context::new();
        pipeline.run_pre_hooks(&ctx, chat_request()).await;
        let (response, error) = pipeline
            .run_post_hooks(&ctx, &NoopTracer, None, Some(GatewayError::provider(500, "boom").boxed()))
            .await;
        assert!(response.is_some());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn nonempty_error_wins_over_response() {
        struct Both;
        #[async_trait]
        impl Plugin for Both {
            fn name(&self) -> &str {
                "both"
            }
            async fn post_hook(
                &self,
                _ctx: &Context,
                _response: Option<Box<Response>>,
                _error: Option<Box<GatewayError>>,
            ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
                (
                    Some(Response::chat("m", ChatMessage::assistant("x")).boxed()),
                    Some(GatewayError::provider(500, "real failure").boxed()),
                )
            }
        }

        let mut pipeline = PluginPipeline::default();
        pipeline.bind(vec![Arc::new(Both)], vec![]);
        let ctx = Context::new();
        pipeline.run_pre_hooks(&ctx, chat_request()).await;
        let (response, error) = pipeline.run_post_hooks(&ctx, &NoopTracer, None, None).await;
        assert!(response.is_none());
        assert_eq!(error.unwrap().error_type, Some(ErrorType::Provider));
    }

    #[tokio::test]
    async fn streaming_mode_accumulates_instead_of_spanning() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = PluginPipeline::default();
        pipeline.bind(vec![plugin("agg", &log, None)], vec![]);
        pipeline.mark_all_pre_executed();

        let ctx = Context::new();
        ctx.set_stream_start_internal(Some(std::time::Instant::now()));
        for _ in 0..4 {
            pipeline
                .run_post_hooks(
                    &ctx,
                    &NoopTracer,
                    Some(Response::chat_chunk("m", ChatMessage::assistant("tok")).boxed()),
                    None,
                )
                .await;
        }
        assert_eq!(pipeline.chunk_count(), 4);
        let stats = &pipeline.stream_stats()["agg"];
        assert_eq!(stats.invocations, 4);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn stream_pipeline_releases_exactly_once() {
        let pool = Arc::new(Pool::new(4, PluginPipeline::default));
        let pipeline = pool.acquire();
        let sp = StreamPipeline::new(
            pool.clone(),
            Arc::new(NoopTracer),
            Context::new(),
            pipeline,
        );
        sp.finalize();
        sp.finalize();
        sp.release_quiet();
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn dropping_unfinalized_stream_pipeline_releases() {
        let pool = Arc::new(Pool::new(4, PluginPipeline::default));
        {
            let pipeline = pool.acquire();
            let _sp = StreamPipeline::new(
                pool.clone(),
                Arc::new(NoopTracer),
                Context::new(),
                pipeline,
            );
        }
        assert_eq!(pool.idle(), 1);
    }
}
