use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::context::Context;
use crate::error::GatewayError;
use crate::keys::Key;
use crate::requests::{ProviderId, Request};
use crate::response::{Response, ResponseStream};

pub mod mock;

pub type ProviderResult = Result<Box<Response>, Box<GatewayError>>;
pub type ProviderStreamResult = Result<ResponseStream, Box<GatewayError>>;

/// Builds the wire adaptor for a provider when it is created or
/// reconfigured. Supplied by the embedding application; the gateway core
/// never speaks a wire protocol itself.
pub type AdaptorFactory = Box<
    dyn Fn(&ProviderId, &ProviderConfig) -> Result<Arc<dyn Provider>, Box<GatewayError>>
        + Send
        + Sync,
>;

fn unsupported<T>(provider: ProviderId, request: &Request) -> Result<T, Box<GatewayError>> {
    Err(GatewayError::unsupported(request.kind, &provider).boxed())
}

/// The wire-level adaptor for one provider: one method per request kind.
///
/// Single-key kinds receive the selected credential; multi-key aggregator
/// kinds receive every eligible credential and report per-key statuses in
/// the response or error extra fields. Every method defaults to an
/// unsupported-operation error so adaptors implement only what their
/// provider offers.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    // Multi-key aggregator operations.

    async fn list_models(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn batch_list(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn batch_retrieve(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn batch_cancel(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn batch_results(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn file_list(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn file_retrieve(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn file_delete(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn file_content(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_list(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_retrieve(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_delete(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_file_list(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_file_retrieve(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_file_content(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn container_file_delete(
        &self,
        ctx: &Context,
        keys: &[Key],
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn video_list(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn video_retrieve(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn video_download(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    async fn video_delete(&self, ctx: &Context, keys: &[Key], request: &Request) -> ProviderResult {
        let _ = (ctx, keys);
        unsupported(self.provider_id(), request)
    }

    // Single-key operations.

    async fn text_completion(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn chat(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn responses(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn count_tokens(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn embedding(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn speech(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn transcription(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_generation(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_edit(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_variation(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn batch_create(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn file_upload(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn container_create(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn container_file_create(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn rerank(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn video_generation(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn video_remix(&self, ctx: &Context, key: &Key, request: &Request) -> ProviderResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    // Streaming operations.

    async fn text_completion_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn chat_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn responses_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn speech_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn transcription_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_generation_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_edit_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }

    async fn image_variation_stream(
        &self,
        ctx: &Context,
        key: &Key,
        request: &Request,
    ) -> ProviderStreamResult {
        let _ = (ctx, key);
        unsupported(self.provider_id(), request)
    }
}
