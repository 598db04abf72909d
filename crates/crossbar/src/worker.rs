use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::account::Account;
use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::GatewayError;
use crate::keys::{Key, KeySelector};
use crate::plugins::pipeline::{PluginPipeline, StreamPipeline};
use crate::plugins::Plugin;
use crate::pool::Pool;
use crate::providers::Provider;
use crate::queue::{ProviderQueue, WorkItem};
use crate::requests::{ProviderId, Request, RequestKind};
use crate::response::{DispatchOutcome, Response, ResponseStream};
use crate::retry;
use crate::telemetry::{SpanKind, SpanStatus, Tracer};

/// Deadline for handing a result back to a caller that is slow to pick it
/// up. After this the value is dropped and the failure logged.
pub(crate) const RESULT_SEND_DEADLINE: Duration = Duration::from_secs(5);

enum KeyScope {
    One(Key),
    Many(Vec<Key>),
}

/// One consumer of a provider queue. A provider runs a cohort of these,
/// sized by its configured concurrency; each pulls work items, selects
/// credentials, drives the adaptor under the retry policy, and answers on
/// the item's result channels.
#[derive(Clone)]
pub(crate) struct Worker {
    pub provider: ProviderId,
    pub config: ProviderConfig,
    pub adaptor: Arc<dyn Provider>,
    pub queue: Arc<ProviderQueue>,
    pub account: Arc<dyn Account>,
    pub selector: Arc<KeySelector>,
    pub tracer: Arc<dyn Tracer>,
    pub pipelines: Arc<Pool<PluginPipeline>>,
    pub llm_plugins: Arc<ArcSwap<Vec<Arc<dyn Plugin>>>>,
}

impl Worker {
    pub(crate) async fn run(self) {
        while let Some(item) = self.queue.recv().await {
            self.process(item).await;
        }
        debug!(provider = %self.provider, "worker exited");
    }

    async fn process(&self, item: WorkItem) {
        let WorkItem {
            ctx,
            request,
            response_tx,
            error_tx,
            stream_tx,
        } = item;

        let base_provider = match (&self.provider, &self.config.base_provider) {
            (ProviderId::Custom(_), Some(base)) => {
                ctx.set_is_custom_provider(true);
                base.clone()
            }
            (provider, _) => provider.clone(),
        };

        let scope = match self.resolve_keys(&ctx, &request, &base_provider).await {
            Ok(scope) => scope,
            Err(error) => {
                self.deliver_error(&request, &error_tx, error).await;
                return;
            }
        };

        // Streaming requests need their own pipeline up front so post-hooks
        // can run per chunk for the life of the stream.
        let stream_pipeline = if request.kind.is_streaming() {
            let mut pipeline = self.pipelines.acquire();
            pipeline.bind(self.llm_plugins.load().as_ref().clone(), Vec::new());
            pipeline.mark_all_pre_executed();
            let sp = StreamPipeline::new(
                self.pipelines.clone(),
                self.tracer.clone(),
                ctx.clone(),
                pipeline,
            );
            // The finalizer must not keep the pipeline holder alive: the
            // holder's context carries this closure, and a strong capture
            // would cycle and leak the pipeline if the consumer walks away
            // mid-stream.
            let weak = Arc::downgrade(&sp);
            ctx.set_stream_finalizer(Some(Arc::new(move || {
                if let Some(sp) = weak.upgrade() {
                    sp.finalize();
                }
            })));
            Some(sp)
        } else {
            None
        };

        let outcome = retry::execute_with_retries(
            &ctx,
            &self.config,
            self.tracer.as_ref(),
            &request,
            |_attempt| self.call_adaptor(&ctx, &scope, &request),
        )
        .await;

        match outcome {
            Ok(DispatchOutcome::Response(mut response)) => {
                if let Some(sp) = &stream_pipeline {
                    sp.release_quiet();
                    ctx.set_stream_finalizer(None);
                }
                self.stamp_response(&ctx, &request, &scope, &mut response);
                self.deliver_response(&request, &response_tx, response).await;
            }
            Ok(DispatchOutcome::Stream(raw)) => {
                let Some(sp) = stream_pipeline else {
                    self.deliver_error(
                        &request,
                        &error_tx,
                        GatewayError::internal("adaptor returned a stream for a unary request")
                            .boxed(),
                    )
                    .await;
                    return;
                };
                let wrapped = wrap_stream(raw, sp.clone(), self.tracer.clone(), ctx.clone());
                let delivered = self.deliver_stream(&request, stream_tx.as_ref(), wrapped).await;
                if !delivered {
                    // The consumer never arrived, so the finalizer will
                    // never fire.
                    sp.release_quiet();
                    ctx.set_stream_finalizer(None);
                }
            }
            Err(error) => {
                if let Some(sp) = &stream_pipeline {
                    sp.release_quiet();
                    ctx.set_stream_finalizer(None);
                }
                self.deliver_error(&request, &error_tx, error).await;
            }
        }
    }

    async fn resolve_keys(
        &self,
        ctx: &Context,
        request: &Request,
        base_provider: &ProviderId,
    ) -> Result<KeyScope, Box<GatewayError>> {
        if request.kind.is_multi_key() {
            let keys = self
                .selector
                .select_all(ctx, self.account.as_ref(), request.kind, &self.provider, base_provider)
                .await?;
            return Ok(KeyScope::Many(keys));
        }

        let span = self.tracer.start_span(ctx, "key.selection", SpanKind::Internal);
        let selected = self
            .selector
            .select(
                ctx,
                self.account.as_ref(),
                request.kind,
                &self.provider,
                &request.model,
                base_provider,
            )
            .await;
        match selected {
            Ok(key) => {
                self.tracer.set_attribute(&span, "key.id", key.id.clone());
                self.tracer.set_attribute(&span, "key.name", key.name.clone());
                self.tracer.end_span(span, SpanStatus::Ok, "");
                ctx.set_selected_key_internal(Some(key.id.clone()), Some(key.name.clone()));
                Ok(KeyScope::One(key))
            }
            Err(error) => {
                self.tracer.end_span(span, SpanStatus::Error, &error.message);
                Err(error)
            }
        }
    }

    async fn call_adaptor(
        &self,
        ctx: &Context,
        scope: &KeyScope,
        request: &Request,
    ) -> Result<DispatchOutcome, Box<GatewayError>> {
        let adaptor = self.adaptor.as_ref();
        match scope {
            KeyScope::Many(keys) => {
                let response = match request.kind {
                    RequestKind::ListModels => adaptor.list_models(ctx, keys, request).await,
                    RequestKind::BatchList => adaptor.batch_list(ctx, keys, request).await,
                    RequestKind::BatchRetrieve => adaptor.batch_retrieve(ctx, keys, request).await,
                    RequestKind::BatchCancel => adaptor.batch_cancel(ctx, keys, request).await,
                    RequestKind::BatchResults => adaptor.batch_results(ctx, keys, request).await,
                    RequestKind::FileList => adaptor.file_list(ctx, keys, request).await,
                    RequestKind::FileRetrieve => adaptor.file_retrieve(ctx, keys, request).await,
                    RequestKind::FileDelete => adaptor.file_delete(ctx, keys, request).await,
                    RequestKind::FileContent => adaptor.file_content(ctx, keys, request).await,
                    RequestKind::ContainerList => adaptor.container_list(ctx, keys, request).await,
                    RequestKind::ContainerRetrieve => {
                        adaptor.container_retrieve(ctx, keys, request).await
                    }
                    RequestKind::ContainerDelete => {
                        adaptor.container_delete(ctx, keys, request).await
                    }
                    RequestKind::ContainerFileList => {
                        adaptor.container_file_list(ctx, keys, request).await
                    }
                    RequestKind::ContainerFileRetrieve => {
                        adaptor.container_file_retrieve(ctx, keys, request).await
                    }
                    RequestKind::ContainerFileContent => {
                        adaptor.container_file_content(ctx, keys, request).await
                    }
                    RequestKind::ContainerFileDelete => {
                        adaptor.container_file_delete(ctx, keys, request).await
                    }
                    RequestKind::VideoList => adaptor.video_list(ctx, keys, request).await,
                    RequestKind::VideoRetrieve => adaptor.video_retrieve(ctx, keys, request).await,
                    RequestKind::VideoDownload => adaptor.video_download(ctx, keys, request).await,
                    RequestKind::VideoDelete => adaptor.video_delete(ctx, keys, request).await,
                    kind => {
                        return Err(GatewayError::internal(format!(
                            "kind {kind} is not a multi-key operation"
                        ))
                        .boxed());
                    }
                };
                response.map(DispatchOutcome::Response)
            }
            KeyScope::One(key) => match request.kind {
                RequestKind::TextCompletion => adaptor
                    .text_completion(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::Chat => {
                    adaptor.chat(ctx, key, request).await.map(DispatchOutcome::Response)
                }
                RequestKind::Responses => adaptor
                    .responses(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::CountTokens => adaptor
                    .count_tokens(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::Embedding => adaptor
                    .embedding(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::Speech => {
                    adaptor.speech(ctx, key, request).await.map(DispatchOutcome::Response)
                }
                RequestKind::Transcription => adaptor
                    .transcription(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::ImageGeneration => adaptor
                    .image_generation(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::ImageEdit => adaptor
                    .image_edit(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::ImageVariation => adaptor
                    .image_variation(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::BatchCreate => adaptor
                    .batch_create(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::FileUpload => adaptor
                    .file_upload(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::ContainerCreate => adaptor
                    .container_create(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::ContainerFileCreate => adaptor
                    .container_file_create(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::Rerank => {
                    adaptor.rerank(ctx, key, request).await.map(DispatchOutcome::Response)
                }
                RequestKind::VideoGeneration => adaptor
                    .video_generation(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::VideoRemix => adaptor
                    .video_remix(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Response),
                RequestKind::TextCompletionStream => adaptor
                    .text_completion_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::ChatStream => adaptor
                    .chat_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::ResponsesStream => adaptor
                    .responses_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::SpeechStream => adaptor
                    .speech_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::TranscriptionStream => adaptor
                    .transcription_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::ImageGenerationStream => adaptor
                    .image_generation_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::ImageEditStream => adaptor
                    .image_edit_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                RequestKind::ImageVariationStream => adaptor
                    .image_variation_stream(ctx, key, request)
                    .await
                    .map(DispatchOutcome::Stream),
                kind => Err(GatewayError::internal(format!(
                    "kind {kind} is a multi-key operation but one key was selected"
                ))
                .boxed()),
            },
        }
    }

    fn stamp_response(
        &self,
        ctx: &Context,
        request: &Request,
        scope: &KeyScope,
        response: &mut Response,
    ) {
        let extra = &mut response.extra;
        extra.request_kind.get_or_insert(request.kind);
        if extra.provider.is_none() {
            extra.provider = Some(request.provider.clone());
        }
        if extra.model_requested.is_none() {
            extra.model_requested = Some(request.model.clone());
        }
        if extra.request_id.is_none() {
            extra.request_id = ctx.request_id();
        }
        if let KeyScope::One(key) = scope {
            extra.selected_key_id.get_or_insert(key.id.clone());
            extra.selected_key_name.get_or_insert(key.name.clone());
        }
        if !self.config.send_back_raw_request {
            extra.raw_request = None;
        }
        if !self.config.send_back_raw_response {
            extra.raw_response = None;
        }
    }

    async fn deliver_response(
        &self,
        request: &Request,
        tx: &mpsc::Sender<Box<Response>>,
        response: Box<Response>,
    ) {
        let response = match tx.try_send(response) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(response))
            | Err(mpsc::error::TrySendError::Closed(response)) => response,
        };
        match tokio::time::timeout(RESULT_SEND_DEADLINE, tx.send(response)).await {
            Ok(Ok(())) => {}
            _ => warn!(
                provider = %self.provider,
                kind = %request.kind,
                "dropping response: caller did not pick it up"
            ),
        }
    }

    async fn deliver_error(
        &self,
        request: &Request,
        tx: &mpsc::Sender<Box<GatewayError>>,
        mut error: Box<GatewayError>,
    ) {
        error.attach_request_info(request.kind, &request.provider, &request.model);
        let error = match tx.try_send(error) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(error))
            | Err(mpsc::error::TrySendError::Closed(error)) => error,
        };
        match tokio::time::timeout(RESULT_SEND_DEADLINE, tx.send(error)).await {
            Ok(Ok(())) => {}
            _ => warn!(
                provider = %self.provider,
                kind = %request.kind,
                "dropping error: caller did not pick it up"
            ),
        }
    }

    /// Returns whether the stream reached a consumer.
    async fn deliver_stream(
        &self,
        request: &Request,
        tx: Option<&mpsc::Sender<ResponseStream>>,
        stream: ResponseStream,
    ) -> bool {
        let Some(tx) = tx else {
            warn!(provider = %self.provider, kind = %request.kind, "work item has no stream channel");
            return false;
        };
        let stream = match tx.try_send(stream) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(stream))
            | Err(mpsc::error::TrySendError::Closed(stream)) => stream,
        };
        match tokio::time::timeout(RESULT_SEND_DEADLINE, tx.send(stream)).await {
            Ok(Ok(())) => true,
            _ => {
                warn!(
                    provider = %self.provider,
                    kind = %request.kind,
                    "dropping stream: caller did not pick it up"
                );
                false
            }
        }
    }
}

/// Wraps an adaptor chunk stream so each chunk passes through the per-chunk
/// post-hooks, and stream end runs exactly one finalize step: the deferred
/// call span is closed and the aggregated plugin spans are emitted.
fn wrap_stream(
    raw: ResponseStream,
    sp: Arc<StreamPipeline>,
    tracer: Arc<dyn Tracer>,
    ctx: Context,
) -> ResponseStream {
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

        if let Some(trace_id) = ctx.trace_id() {
            if let Some(span) = tracer.take_deferred_span(&trace_id) {
                tracer.end_span(span, SpanStatus::Ok, "");
            }
        }
        if let Some(finalizer) = ctx.take_stream_finalizer() {
            finalizer();
        } else {
            sp.finalize();
        }
    })
}
