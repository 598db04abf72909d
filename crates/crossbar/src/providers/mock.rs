//! Scripted in-memory adaptor backing the test suites. Outcomes are queued
//! ahead of time; when the script runs dry every call succeeds with a
//! synthesized response.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{GatewayError, KeyStatus};
use crate::keys::Key;
use crate::providers::{Provider, ProviderResult, ProviderStreamResult};
use crate::requests::{ChatMessage, ProviderId, Request, RequestKind};
use crate::response::{ModelEntry, Response, ResponseBody};

type MockChunk = Result<Box<Response>, Box<GatewayError>>;

pub enum MockOutcome {
    Respond(Box<Response>),
    Fail(Box<GatewayError>),
    Stream(Vec<MockChunk>),
}

#[derive(Default)]
struct MockState {
    outcomes: VecDeque<MockOutcome>,
    call_log: Vec<RequestKind>,
    seen_key_ids: Vec<Vec<String>>,
    delay: Option<Duration>,
}

/// Observes worker concurrency from inside adaptor calls.
#[derive(Default)]
struct BusyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl BusyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockProvider {
    id: ProviderId,
    state: Mutex<MockState>,
    busy: BusyGauge,
}

impl MockProvider {
    pub fn new(id: ProviderId) -> Arc<Self> {
        Arc::new(MockProvider {
            id,
            state: Mutex::new(MockState::default()),
            busy: BusyGauge::default(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn script(&self, outcome: MockOutcome) {
        self.lock().outcomes.push_back(outcome);
    }

    pub fn script_error(&self, error: GatewayError) {
        self.script(MockOutcome::Fail(error.boxed()));
    }

    pub fn script_response(&self, response: Response) {
        self.script(MockOutcome::Respond(response.boxed()));
    }

    pub fn script_stream(&self, chunks: Vec<MockChunk>) {
        self.script(MockOutcome::Stream(chunks));
    }

    /// Slows every call down, so tests can fill queues deterministically.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn calls(&self) -> Vec<RequestKind> {
        self.lock().call_log.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().call_log.len()
    }

    pub fn seen_key_ids(&self) -> Vec<Vec<String>> {
        self.lock().seen_key_ids.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.busy.peak.load(Ordering::SeqCst)
    }

    fn record(
        &self,
        kind: RequestKind,
        key_ids: Vec<String>,
    ) -> (Option<MockOutcome>, Option<Duration>) {
        let mut state = self.lock();
        state.call_log.push(kind);
        state.seen_key_ids.push(key_ids);
        (state.outcomes.pop_front(), state.delay)
    }

    fn default_response(&self, request: &Request, keys: &[Key]) -> Box<Response> {
        let body = match request.kind {
            RequestKind::ListModels => ResponseBody::Models {
                models: vec![ModelEntry {
                    id: format!("{}-mock-model", self.id),
                    owned_by: Some(self.id.to_string()),
                }],
            },
            RequestKind::Embedding => ResponseBody::Embedding {
                vectors: vec![vec![0.0, 1.0, 0.0]],
            },
            RequestKind::CountTokens => ResponseBody::TokenCount { tokens: 42 },
            _ => {
                return Response::chat(
                    request.model.clone(),
                    ChatMessage::assistant("mock response"),
                )
                .boxed();
            }
        };
        let mut response = Response::new("mock", request.model.clone(), body);
        response.extra.key_statuses = keys
            .iter()
            .map(|k| KeyStatus {
                key_id: k.id.clone(),
                key_name: k.name.clone(),
                success: true,
                message: None,
            })
            .collect();
        response.boxed()
    }

    async fn respond(&self, kind: RequestKind, keys: &[Key], request: &Request) -> ProviderResult {
        self.busy.enter();
        let (outcome, delay) = self.record(kind, keys.iter().map(|k| k.id.clone()).collect());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.busy.exit();
        match outcome {
            Some(MockOutcome::Respond(response)) => Ok(response),
            Some(MockOutcome::Fail(error)) => Err(error),
            Some(MockOutcome::Stream(_)) => {
                Err(GatewayError::internal("scripted stream for unary call").boxed())
            }
            None => Ok(self.default_response(request, keys)),
        }
    }

    async fn respond_stream(
        &self,
        kind: RequestKind,
        keys: &[Key],
        request: &Request,
    ) -> ProviderStreamResult {
        self.busy.enter();
        let (outcome, delay) = self.record(kind, keys.iter().map(|k| k.id.clone()).collect());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.busy.exit();
        match outcome {
            Some(MockOutcome::Stream(mut chunks)) => {
                if let Some(Ok(last)) = chunks.last_mut() {
                    last.extra.stream_end = true;
                }
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            Some(MockOutcome::Fail(error)) => Err(error),
            Some(MockOutcome::Respond(_)) => {
                Err(GatewayError::internal("scripted unary outcome for stream call").boxed())
            }
            None => {
                let mut last = Response::chat_chunk(
                    request.model.clone(),
                    ChatMessage::assistant("mock chunk"),
                );
                last.extra.stream_end = true;
                let chunks: Vec<MockChunk> = vec![Ok(last.boxed())];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn list_models(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::ListModels, keys, request).await
    }

    async fn batch_list(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::BatchList, keys, request).await
    }

    async fn batch_retrieve(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::BatchRetrieve, keys, request).await
    }

    async fn batch_cancel(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::BatchCancel, keys, request).await
    }

    async fn batch_results(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::BatchResults, keys, request).await
    }

    async fn file_list(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::FileList, keys, request).await
    }

    async fn file_retrieve(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::FileRetrieve, keys, request).await
    }

    async fn file_delete(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::FileDelete, keys, request).await
    }

    async fn file_content(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::FileContent, keys, request).await
    }

    async fn container_list(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerList, keys, request).await
    }

    async fn container_retrieve(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerRetrieve, keys, request).await
    }

    async fn container_delete(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerDelete, keys, request).await
    }

    async fn container_file_list(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerFileList, keys, request).await
    }

    async fn container_file_retrieve(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerFileRetrieve, keys, request)
            .await
    }

    async fn container_file_content(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerFileContent, keys, request)
            .await
    }

    async fn container_file_delete(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerFileDelete, keys, request)
            .await
    }

    async fn video_list(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::VideoList, keys, request).await
    }

    async fn video_retrieve(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::VideoRetrieve, keys, request).await
    }

    async fn video_download(
        &self,
        _ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::VideoDownload, keys, request).await
    }

    async fn video_delete(&self, _ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        self.respond(RequestKind::VideoDelete, keys, request).await
    }

    async fn text_completion(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::TextCompletion, std::slice::from_ref(key), request)
            .await
    }

    async fn chat(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Chat, std::slice::from_ref(key), request)
            .await
    }

    async fn responses(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Responses, std::slice::from_ref(key), request)
            .await
    }

    async fn count_tokens(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::CountTokens, std::slice::from_ref(key), request)
            .await
    }

    async fn embedding(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Embedding, std::slice::from_ref(key), request)
            .await
    }

    async fn speech(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Speech, std::slice::from_ref(key), request)
            .await
    }

    async fn transcription(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Transcription, std::slice::from_ref(key), request)
            .await
    }

    async fn image_generation(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ImageGeneration, std::slice::from_ref(key), request)
            .await
    }

    async fn image_edit(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::ImageEdit, std::slice::from_ref(key), request)
            .await
    }

    async fn image_variation(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ImageVariation, std::slice::from_ref(key), request)
            .await
    }

    async fn batch_create(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::BatchCreate, std::slice::from_ref(key), request)
            .await
    }

    async fn file_upload(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::FileUpload, std::slice::from_ref(key), request)
            .await
    }

    async fn container_create(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerCreate, std::slice::from_ref(key), request)
            .await
    }

    async fn container_file_create(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::ContainerFileCreate, std::slice::from_ref(key), request)
            .await
    }

    async fn rerank(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::Rerank, std::slice::from_ref(key), request)
            .await
    }

    async fn video_generation(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        self.respond(RequestKind::VideoGeneration, std::slice::from_ref(key), request)
            .await
    }

    async fn video_remix(&self, _ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        self.respond(RequestKind::VideoRemix, std::slice::from_ref(key), request)
            .await
    }

    async fn text_completion_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::TextCompletionStream, std::slice::from_ref(key), request)
            .await
    }

    async fn chat_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::ChatStream, std::slice::from_ref(key), request)
            .await
    }

    async fn responses_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::ResponsesStream, std::slice::from_ref(key), request)
            .await
    }

    async fn speech_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::SpeechStream, std::slice::from_ref(key), request)
            .await
    }

    async fn transcription_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::TranscriptionStream, std::slice::from_ref(key), request)
            .await
    }

    async fn image_generation_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(
            RequestKind::ImageGenerationStream,
            std::slice::from_ref(key),
            request,
        )
        .await
    }

    async fn image_edit_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::ImageEditStream, std::slice::from_ref(key), request)
            .await
    }

    async fn image_variation_stream(
        &self,
        _ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        self.respond_stream(RequestKind::ImageVariationStream, std::slice::from_ref(key), request)
            .await
    }
}
