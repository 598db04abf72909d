use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::{GatewayConfig, ProviderConfig};
use crate::context::Context;
use crate::error::{GatewayError, KeyStatus};
use crate::keys::KeySelector;
use crate::mcp::{McpClient, McpHookRunner, McpManager, ToolInvocation};
use crate::plugins::pipeline::PluginPipeline;
use crate::plugins::{McpPlugin, Plugin};
use crate::pool::Pool;
use crate::providers::{AdaptorFactory, Provider};
use crate::queue::{ProviderQueue, WorkItem};
use crate::requests::{
    ChatMessage, ListModelsPayload, ProviderId, Request, RequestKind, RequestPayload,
};
use crate::response::{DispatchOutcome, ModelEntry, Response, ResponseBody, ResponseStream};
use crate::telemetry::{NoopTracer, Tracer, TracerSlot};
use crate::worker::Worker;

/// Deadline for moving one stranded work item onto the new queue during a
/// reconfigure.
const TRANSFER_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for pushing the synthesized reconfigure error to a stranded
/// item's error channel.
const TRANSFER_ERROR_DEADLINE: Duration = Duration::from_secs(1);

/// Bound on copy-then-swap retries for the shared adaptor and plugin tables.
const MAX_SWAP_RETRIES: usize = 100;

type AdaptorTable = HashMap<ProviderId, Arc<dyn Provider>>;

/// Pushes the synthesized reconfigure error to a stranded item's error
/// channel: a non-blocking try, then a bounded send, then log and drop.
async fn send_reconfigure_error(
    provider: &ProviderId,
    error_tx: tokio::sync::mpsc::Sender<Box<GatewayError>>,
) {
    let error = GatewayError::reconfigure(provider).boxed();
    let error = match error_tx.try_send(error) {
        Ok(()) => return,
        Err(tokio::sync::mpsc::error::TrySendError::Full(error))
        | Err(tokio::sync::mpsc::error::TrySendError::Closed(error)) => error,
    };
    if tokio::time::timeout(TRANSFER_ERROR_DEADLINE, error_tx.send(error))
        .await
        .map_or(true, |sent| sent.is_err())
    {
        warn!(provider = %provider, "dropping reconfigure error: caller gone");
    }
}

fn bounded_rcu<T: Clone>(
    cell: &ArcSwap<T>,
    mut update: impl FnMut(&T) -> T,
) -> Result<(), Box<GatewayError>> {
    for _ in 0..MAX_SWAP_RETRIES {
        let current = cell.load_full();
        let next = Arc::new(update(&current));
        let previous = cell.compare_and_swap(&current, next);
        if Arc::ptr_eq(&previous, &current) {
            return Ok(());
        }
    }
    Err(GatewayError::internal("shared table update lost the swap race repeatedly").boxed())
}

/// The request-dispatch gateway.
///
/// Owns the per-provider queues and worker cohorts, the plugin chains, the
/// MCP manager, the tracer, and the account seam. Construction pre-creates
/// every provider the account reports; unknown-but-known-shaped providers
/// are created lazily on first use.
pub struct Gateway {
    account: Arc<dyn Account>,
    factory: AdaptorFactory,
    adaptors: ArcSwap<AdaptorTable>,
    queues: DashMap<ProviderId, Arc<ProviderQueue>>,
    cohorts: DashMap<ProviderId, TaskTracker>,
    locks: DashMap<ProviderId, Arc<tokio::sync::RwLock<()>>>,
    pub(crate) llm_plugins: Arc<ArcSwap<Vec<Arc<dyn Plugin>>>>,
    pub(crate) mcp_plugins: Arc<ArcSwap<Vec<Arc<dyn McpPlugin>>>>,
    mcp: Option<Arc<McpManager>>,
    pub(crate) tracer: Arc<TracerSlot>,
    drop_excess: AtomicBool,
    pub(crate) pipelines: Arc<Pool<PluginPipeline>>,
    selector: Arc<KeySelector>,
    config: RwLock<GatewayConfig>,
    root: CancellationToken,
}

impl Gateway {
    pub async fn new(
        config: GatewayConfig,
        account: Arc<dyn Account>,
        factory: AdaptorFactory,
    ) -> Result<Gateway, Box<GatewayError>> {
        let mcp = config.mcp.clone().map(|cfg| Arc::new(McpManager::new(cfg)));
        let gateway = Gateway {
            account,
            factory,
            adaptors: ArcSwap::from_pointee(AdaptorTable::new()),
            queues: DashMap::new(),
            cohorts: DashMap::new(),
            locks: DashMap::new(),
            llm_plugins: Arc::new(ArcSwap::from_pointee(Vec::new())),
            mcp_plugins: Arc::new(ArcSwap::from_pointee(Vec::new())),
            mcp,
            tracer: Arc::new(TracerSlot::new(Arc::new(NoopTracer))),
            drop_excess: AtomicBool::new(config.drop_excess_requests),
            pipelines: Arc::new(Pool::new(config.pipeline_pool_size, PluginPipeline::default)),
            selector: Arc::new(KeySelector::default()),
            config: RwLock::new(config),
            root: CancellationToken::new(),
        };

        for provider in gateway.account.configured_providers() {
            let provider_config = gateway
                .account
                .config_for(&provider)
                .unwrap_or_default();
            let lock = gateway.provider_lock(&provider);
            let _guard = lock.write().await;
            gateway.create_provider_locked(&provider, provider_config)?;
        }

        Ok(gateway)
    }

    /// A fresh call context whose cancellation follows the process context.
    pub fn new_context(&self) -> Context {
        Context::child_of(&self.root)
    }

    pub fn set_tracer(&self, tracer: Arc<dyn Tracer>) {
        self.tracer.set(tracer);
    }

    pub fn set_drop_excess_requests(&self, drop: bool) {
        self.drop_excess.store(drop, Ordering::Release);
    }

    pub(crate) fn drop_excess_requests(&self) -> bool {
        self.drop_excess.load(Ordering::Acquire)
    }

    /// Replaces runtime-tunable gateway settings.
    pub fn update_config(&self, config: GatewayConfig) {
        self.drop_excess
            .store(config.drop_excess_requests, Ordering::Release);
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn mcp_manager(&self) -> Option<&Arc<McpManager>> {
        self.mcp.as_ref()
    }

    fn provider_lock(&self, provider: &ProviderId) -> Arc<tokio::sync::RwLock<()>> {
        self.locks
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone()
    }

    /// Resolves the provider's queue, creating the provider on first use
    /// when the account has (or defaults imply) a configuration for it.
    pub(crate) async fn queue_for(
        &self,
        provider: &ProviderId,
    ) -> Result<Arc<ProviderQueue>, Box<GatewayError>> {
        if let Some(queue) = self.queues.get(provider) {
            return Ok(queue.clone());
        }

        let config = match self.account.config_for(provider) {
            Some(config) => config,
            None if provider.supports_dynamic_init() => ProviderConfig::default(),
            None => {
                return Err(GatewayError::not_configured(format!(
                    "provider {provider} is not configured"
                ))
                .boxed());
            }
        };

        let lock = self.provider_lock(provider);
        let _guard = lock.write().await;
        if let Some(queue) = self.queues.get(provider) {
            return Ok(queue.clone());
        }
        self.create_provider_locked(provider, config)
    }

    /// Creates queue, adaptor, and worker cohort. The per-provider write
    /// lock must be held.
    fn create_provider_locked(
        &self,
        provider: &ProviderId,
        config: ProviderConfig,
    ) -> Result<Arc<ProviderQueue>, Box<GatewayError>> {
        let queue = Arc::new(ProviderQueue::new(provider.clone(), config.buffer_size));
        let adaptor = (self.factory)(provider, &config)?;
        bounded_rcu(&self.adaptors, |table| {
            let mut table = table.clone();
            table.insert(provider.clone(), adaptor.clone());
            table
        })?;
        self.queues.insert(provider.clone(), queue.clone());
        let tracker = self.spawn_cohort(provider, &config, adaptor, queue.clone());
        self.cohorts.insert(provider.clone(), tracker);
        info!(provider = %provider, concurrency = config.concurrency, buffer = config.buffer_size, "provider ready");
        Ok(queue)
    }

    fn spawn_cohort(
        &self,
        provider: &ProviderId,
        config: &ProviderConfig,
        adaptor: Arc<dyn Provider>,
        queue: Arc<ProviderQueue>,
    ) -> TaskTracker {
        let tracker = TaskTracker::new();
        let worker = Worker {
            provider: provider.clone(),
            config: config.clone(),
            adaptor,
            queue,
            account: self.account.clone(),
            selector: self.selector.clone(),
            tracer: self.tracer.clone(),
            pipelines: self.pipelines.clone(),
            llm_plugins: self.llm_plugins.clone(),
        };
        for _ in 0..config.concurrency.max(1) {
            tracker.spawn(worker.clone().run());
        }
        tracker.close();
        tracker
    }

    /// Replaces a provider's queue, adaptor, and cohort without losing
    /// already-enqueued work. Items that cannot be moved to the new queue
    /// within the transfer deadline receive a reconfigure error.
    pub async fn update_provider(
        &self,
        provider: &ProviderId,
        config: ProviderConfig,
    ) -> Result<(), Box<GatewayError>> {
        let lock = self.provider_lock(provider);
        let _guard = lock.write().await;

        let Some(old_queue) = self.queues.get(provider).map(|q| q.clone()) else {
            self.create_provider_locked(provider, config)?;
            return Ok(());
        };

        let new_queue = Arc::new(ProviderQueue::new(provider.clone(), config.buffer_size));
        self.queues.insert(provider.clone(), new_queue.clone());
        old_queue.signal_closing();

        // Move whatever the old workers have not picked up yet.
        while let Some(item) = old_queue.try_pop() {
            if let Err(item) = new_queue.try_enqueue(item) {
                self.spawn_transfer(provider.clone(), new_queue.clone(), item);
            }
        }

        old_queue.close();
        if let Some((_, tracker)) = self.cohorts.remove(provider) {
            tracker.wait().await;
        }

        let adaptor = match (self.factory)(provider, &config) {
            Ok(adaptor) => adaptor,
            Err(error) => {
                // The new queue is already published and has no cohort;
                // undo the publish and answer every item the drain moved
                // into it.
                new_queue.signal_closing();
                new_queue.close();
                self.queues.remove(provider);
                while let Some(item) = new_queue.try_pop() {
                    self.spawn_reconfigure_failure(provider.clone(), item);
                }
                return Err(error);
            }
        };
        bounded_rcu(&self.adaptors, |table| {
            let mut table = table.clone();
            table.insert(provider.clone(), adaptor.clone());
            table
        })?;

        let tracker = self.spawn_cohort(provider, &config, adaptor, new_queue);
        self.cohorts.insert(provider.clone(), tracker);
        info!(provider = %provider, "provider reconfigured");
        Ok(())
    }

    fn spawn_transfer(&self, provider: ProviderId, queue: Arc<ProviderQueue>, item: WorkItem) {
        tokio::spawn(async move {
            let error_tx = item.error_tx.clone();
            match tokio::time::timeout(TRANSFER_DEADLINE, queue.enqueue_blocking(item)).await {
                Ok(Ok(())) => return,
                Ok(Err(())) | Err(_) => {}
            }
            send_reconfigure_error(&provider, error_tx).await;
        });
    }

    /// Answers a work item stranded by a failed reconfigure with the
    /// synthesized reconfigure error.
    fn spawn_reconfigure_failure(&self, provider: ProviderId, item: WorkItem) {
        tokio::spawn(async move {
            let error_tx = item.error_tx.clone();
            drop(item);
            send_reconfigure_error(&provider, error_tx).await;
        });
    }

    /// Tears a provider down: no new work, drain, stop the cohort, drop the
    /// adaptor entry.
    pub async fn remove_provider(&self, provider: &ProviderId) -> Result<(), Box<GatewayError>> {
        let lock = self.provider_lock(provider);
        let _guard = lock.write().await;

        let Some((_, queue)) = self.queues.remove(provider) else {
            return Err(GatewayError::not_configured(format!(
                "provider {provider} is not configured"
            ))
            .boxed());
        };
        queue.signal_closing();
        queue.close();
        if let Some((_, tracker)) = self.cohorts.remove(provider) {
            tracker.wait().await;
        }
        bounded_rcu(&self.adaptors, |table| {
            let mut table = table.clone();
            table.remove(provider);
            table
        })?;
        info!(provider = %provider, "provider removed");
        Ok(())
    }

    /// Stops everything: cancels the process context, force-closes every
    /// queue so workers exit even if the context was already cancelled,
    /// waits for every cohort, and cleans up MCP, plugins, and the tracer.
    pub async fn shutdown(&self) {
        self.root.cancel();

        for entry in self.queues.iter() {
            entry.value().signal_closing();
            entry.value().close();
        }

        let providers: Vec<ProviderId> = self.cohorts.iter().map(|e| e.key().clone()).collect();
        for provider in providers {
            if let Some((_, tracker)) = self.cohorts.remove(&provider) {
                tracker.wait().await;
            }
        }
        self.queues.clear();

        if let Some(mcp) = &self.mcp {
            mcp.cleanup().await;
        }

        for plugin in self.llm_plugins.swap(Arc::new(Vec::new())).iter() {
            if let Err(error) = plugin.cleanup().await {
                warn!(plugin = plugin.name(), error = %error, "plugin cleanup failed");
            }
        }
        for plugin in self.mcp_plugins.swap(Arc::new(Vec::new())).iter() {
            if let Err(error) = plugin.cleanup().await {
                warn!(plugin = plugin.name(), error = %error, "mcp plugin cleanup failed");
            }
        }

        self.tracer.get().stop();
        debug!("gateway shut down");
    }

    // Plugin administration.

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), Box<GatewayError>> {
        bounded_rcu(&self.llm_plugins, |plugins| {
            let mut plugins = plugins.clone();
            plugins.push(plugin.clone());
            plugins
        })
    }

    pub async fn remove_plugin(&self, name: &str) -> Result<(), Box<GatewayError>> {
        let Some(removed) = self
            .llm_plugins
            .load()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
        else {
            return Err(GatewayError::not_configured(format!("plugin {name} not found")).boxed());
        };
        bounded_rcu(&self.llm_plugins, |plugins| {
            plugins.iter().filter(|p| p.name() != name).cloned().collect()
        })?;
        if let Err(error) = removed.cleanup().await {
            warn!(plugin = name, error = %error, "plugin cleanup failed");
        }
        Ok(())
    }

    /// Swaps a plugin in place by name and cleans up the replaced instance.
    pub async fn update_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), Box<GatewayError>> {
        let name = plugin.name().to_string();
        let Some(replaced) = self
            .llm_plugins
            .load()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
        else {
            return Err(GatewayError::not_configured(format!("plugin {name} not found")).boxed());
        };
        bounded_rcu(&self.llm_plugins, |plugins| {
            plugins
                .iter()
                .map(|p| {
                    if p.name() == name {
                        plugin.clone()
                    } else {
                        p.clone()
                    }
                })
                .collect()
        })?;
        if let Err(error) = replaced.cleanup().await {
            warn!(plugin = %name, error = %error, "replaced plugin cleanup failed");
        }
        Ok(())
    }

    pub fn add_mcp_plugin(&self, plugin: Arc<dyn McpPlugin>) -> Result<(), Box<GatewayError>> {
        bounded_rcu(&self.mcp_plugins, |plugins| {
            let mut plugins = plugins.clone();
            plugins.push(plugin.clone());
            plugins
        })
    }

    pub async fn remove_mcp_plugin(&self, name: &str) -> Result<(), Box<GatewayError>> {
        let Some(removed) = self
            .mcp_plugins
            .load()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
        else {
            return Err(
                GatewayError::not_configured(format!("mcp plugin {name} not found")).boxed(),
            );
        };
        bounded_rcu(&self.mcp_plugins, |plugins| {
            plugins.iter().filter(|p| p.name() != name).cloned().collect()
        })?;
        if let Err(error) = removed.cleanup().await {
            warn!(plugin = name, error = %error, "mcp plugin cleanup failed");
        }
        Ok(())
    }

    // MCP administration and orchestration.

    fn mcp_or_err(&self) -> Result<&Arc<McpManager>, Box<GatewayError>> {
        self.mcp
            .as_ref()
            .ok_or_else(|| GatewayError::not_configured("mcp is not configured").boxed())
    }

    pub fn add_mcp_client(&self, client: Arc<dyn McpClient>) -> Result<(), Box<GatewayError>> {
        self.mcp_or_err()?.add_client(client)
    }

    pub async fn remove_mcp_client(&self, name: &str) -> Result<(), Box<GatewayError>> {
        self.mcp_or_err()?.remove_client(name).await
    }

    pub async fn reconnect_mcp_client(&self, name: &str) -> Result<(), Box<GatewayError>> {
        self.mcp_or_err()?.reconnect_client(name).await
    }

    /// Executes one tool call through the MCP hook chain.
    pub async fn execute_mcp_tool(
        &self,
        ctx: &Context,
        invocation: ToolInvocation,
    ) -> Result<ChatMessage, Box<GatewayError>> {
        let mcp = self.mcp_or_err()?;
        let runner = McpHookRunner {
            pipelines: self.pipelines.as_ref(),
            plugins: self.mcp_plugins.load().as_ref().clone(),
        };
        mcp.execute_tool(ctx, &runner, invocation).await
    }

    /// Runs the agent loop: executes the tool calls in `initial_response`,
    /// re-invokes the model with the augmented conversation, and repeats to
    /// fixed point.
    pub async fn run_agent(
        &self,
        ctx: Option<Context>,
        request: Request,
        initial_response: Box<Response>,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        let ctx = ctx.unwrap_or_else(|| self.new_context());
        let mcp = self.mcp_or_err()?;
        let runner = McpHookRunner {
            pipelines: self.pipelines.as_ref(),
            plugins: self.mcp_plugins.load().as_ref().clone(),
        };
        mcp.run_agent(&ctx, &runner, &request, initial_response, |conversation| {
            let ctx = ctx.clone();
            async move {
                match self.execute(Some(ctx), conversation).await? {
                    DispatchOutcome::Response(response) => Ok(response),
                    DispatchOutcome::Stream(_) => {
                        Err(GatewayError::internal("agent loop received a stream").boxed())
                    }
                }
            }
        })
        .await
    }

    // Public per-kind API. Each wrapper checks the envelope kind and
    // unwraps the matching outcome shape.

    async fn unary(
        &self,
        kind: RequestKind,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        if request.kind != kind {
            return Err(GatewayError::validation(format!(
                "expected a {kind} request, got {}",
                request.kind
            ))
            .boxed());
        }
        match self.execute(ctx, request).await? {
            DispatchOutcome::Response(response) => Ok(response),
            DispatchOutcome::Stream(_) => {
                Err(GatewayError::internal("unary dispatch produced a stream").boxed())
            }
        }
    }

    async fn streaming(
        &self,
        kind: RequestKind,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        if request.kind != kind {
            return Err(GatewayError::validation(format!(
                "expected a {kind} request, got {}",
                request.kind
            ))
            .boxed());
        }
        match self.execute(ctx, request).await? {
            DispatchOutcome::Stream(stream) => Ok(stream),
            DispatchOutcome::Response(_) => {
                Err(GatewayError::internal("streaming dispatch produced a unary response").boxed())
            }
        }
    }

    pub async fn list_models(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ListModels, ctx, request).await
    }

    pub async fn text_completion(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::TextCompletion, ctx, request).await
    }

    pub async fn text_completion_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::TextCompletionStream, ctx, request).await
    }

    pub async fn chat(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Chat, ctx, request).await
    }

    pub async fn chat_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::ChatStream, ctx, request).await
    }

    pub async fn responses(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Responses, ctx, request).await
    }

    pub async fn responses_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::ResponsesStream, ctx, request).await
    }

    pub async fn count_tokens(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::CountTokens, ctx, request).await
    }

    pub async fn embedding(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Embedding, ctx, request).await
    }

    pub async fn speech(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Speech, ctx, request).await
    }

    pub async fn speech_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::SpeechStream, ctx, request).await
    }

    pub async fn transcription(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Transcription, ctx, request).await
    }

    pub async fn transcription_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::TranscriptionStream, ctx, request).await
    }

    pub async fn image_generation(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ImageGeneration, ctx, request).await
    }

    pub async fn image_generation_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::ImageGenerationStream, ctx, request).await
    }

    pub async fn image_edit(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ImageEdit, ctx, request).await
    }

    pub async fn image_edit_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::ImageEditStream, ctx, request).await
    }

    pub async fn image_variation(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ImageVariation, ctx, request).await
    }

    pub async fn image_variation_stream(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<ResponseStream, Box<GatewayError>> {
        self.streaming(RequestKind::ImageVariationStream, ctx, request).await
    }

    pub async fn batch_create(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::BatchCreate, ctx, request).await
    }

    pub async fn batch_list(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::BatchList, ctx, request).await
    }

    pub async fn batch_retrieve(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::BatchRetrieve, ctx, request).await
    }

    pub async fn batch_cancel(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::BatchCancel, ctx, request).await
    }

    pub async fn batch_results(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::BatchResults, ctx, request).await
    }

    pub async fn file_upload(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::FileUpload, ctx, request).await
    }

    pub async fn file_list(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::FileList, ctx, request).await
    }

    pub async fn file_retrieve(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::FileRetrieve, ctx, request).await
    }

    pub async fn file_delete(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::FileDelete, ctx, request).await
    }

    pub async fn file_content(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::FileContent, ctx, request).await
    }

    pub async fn container_create(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerCreate, ctx, request).await
    }

    pub async fn container_list(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerList, ctx, request).await
    }

    pub async fn container_retrieve(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerRetrieve, ctx, request).await
    }

    pub async fn container_delete(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerDelete, ctx, request).await
    }

    pub async fn container_file_create(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerFileCreate, ctx, request).await
    }

    pub async fn container_file_list(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerFileList, ctx, request).await
    }

    pub async fn container_file_retrieve(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerFileRetrieve, ctx, request).await
    }

    pub async fn container_file_content(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerFileContent, ctx, request).await
    }

    pub async fn container_file_delete(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::ContainerFileDelete, ctx, request).await
    }

    pub async fn rerank(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::Rerank, ctx, request).await
    }

    pub async fn video_generation(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoGeneration, ctx, request).await
    }

    pub async fn video_list(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoList, ctx, request).await
    }

    pub async fn video_retrieve(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoRetrieve, ctx, request).await
    }

    pub async fn video_download(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoDownload, ctx, request).await
    }

    pub async fn video_remix(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoRemix, ctx, request).await
    }

    pub async fn video_delete(
        &self,
        ctx: Option<Context>,
        request: Request,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        self.unary(RequestKind::VideoDelete, ctx, request).await
    }

    /// Lists models across every configured provider concurrently, paging
    /// each provider up to the configured cap and collecting per-provider
    /// key statuses. Providers that fail contribute a failed status instead
    /// of sinking the whole aggregate; if every provider fails, the last
    /// error is returned.
    pub async fn list_all_models(
        &self,
        ctx: Option<Context>,
    ) -> Result<Box<Response>, Box<GatewayError>> {
        let ctx = ctx.unwrap_or_else(|| self.new_context());
        let (page_size, max_pages) = {
            let config = self
                .config
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (config.list_models_page_size, config.list_models_max_pages)
        };

        let providers = self.account.configured_providers();
        let sweeps = providers
            .iter()
            .map(|provider| self.list_provider_models(&ctx, provider, page_size, max_pages));
        let results = futures::future::join_all(sweeps).await;

        let mut models = Vec::new();
        let mut statuses = Vec::new();
        let mut last_error: Option<Box<GatewayError>> = None;
        let mut successes = 0usize;
        for (provider, result, mut provider_statuses) in results {
            statuses.append(&mut provider_statuses);
            match result {
                Ok(mut provider_models) => {
                    successes += 1;
                    models.append(&mut provider_models);
                }
                Err(error) => {
                    statuses.push(KeyStatus {
                        key_id: String::new(),
                        key_name: provider.to_string(),
                        success: false,
                        message: Some(error.message.clone()),
                    });
                    last_error = Some(error);
                }
            }
        }

        if successes == 0 {
            if let Some(mut error) = last_error {
                error.extra.key_statuses = statuses;
                return Err(error);
            }
        }

        let mut response = Response::new("model.list", "", ResponseBody::Models { models });
        response.extra.request_kind = Some(RequestKind::ListModels);
        response.extra.request_id = ctx.request_id();
        response.extra.key_statuses = statuses;
        Ok(response.boxed())
    }

    async fn list_provider_models(
        &self,
        ctx: &Context,
        provider: &ProviderId,
        page_size: u32,
        max_pages: u32,
    ) -> (ProviderId, Result<Vec<ModelEntry>, Box<GatewayError>>, Vec<KeyStatus>) {
        let mut models = Vec::new();
        let mut statuses = Vec::new();
        for page in 0..max_pages.max(1) {
            let request = Request::new(
                RequestKind::ListModels,
                provider.clone(),
                "",
                RequestPayload::ListModels(ListModelsPayload {
                    page_size: Some(page_size),
                }),
            )
            .with_params(serde_json::json!({ "page": page }));

            match self.execute(Some(ctx.clone()), request).await {
                Ok(DispatchOutcome::Response(response)) => {
                    statuses.extend(response.extra.key_statuses.clone());
                    let ResponseBody::Models { models: page_models } = response.body else {
                        break;
                    };
                    let full_page = page_models.len() as u32 >= page_size;
                    models.extend(page_models);
                    if !full_page {
                        break;
                    }
                }
                Ok(DispatchOutcome::Stream(_)) => break,
                Err(error) => return (provider.clone(), Err(error), statuses),
            }
        }
        (provider.clone(), Ok(models), statuses)
    }
}
