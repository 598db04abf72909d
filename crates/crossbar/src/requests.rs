use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Identity of a provider backend. `Custom` providers declare a base type in
/// their configuration so the gateway knows which wire family they speak.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Azure,
    Bedrock,
    Vertex,
    Cohere,
    Mistral,
    Ollama,
    Groq,
    Replicate,
    Custom(String),
}

impl ProviderId {
    /// Providers that resolve models through a per-key deployment table.
    pub fn is_deployment_scoped(&self) -> bool {
        matches!(
            self,
            ProviderId::Azure | ProviderId::Bedrock | ProviderId::Vertex | ProviderId::Replicate
        )
    }

    /// Providers that accept requests without a key value.
    pub fn allows_empty_key(&self) -> bool {
        matches!(self, ProviderId::Ollama)
    }

    /// Providers whose credentials can live outside the key record (IAM
    /// roles, application-default credentials).
    pub fn has_ambient_credentials(&self) -> bool {
        matches!(self, ProviderId::Bedrock | ProviderId::Vertex)
    }

    /// The set of providers that can be created on first use with a default
    /// configuration when the account supplies none.
    pub fn supports_dynamic_init(&self) -> bool {
        !matches!(self, ProviderId::Custom(_))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Azure => "azure",
            ProviderId::Bedrock => "bedrock",
            ProviderId::Vertex => "vertex",
            ProviderId::Cohere => "cohere",
            ProviderId::Mistral => "mistral",
            ProviderId::Ollama => "ollama",
            ProviderId::Groq => "groq",
            ProviderId::Replicate => "replicate",
            ProviderId::Custom(name) => name,
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "openai" => ProviderId::OpenAi,
            "anthropic" => ProviderId::Anthropic,
            "azure" => ProviderId::Azure,
            "bedrock" => ProviderId::Bedrock,
            "vertex" => ProviderId::Vertex,
            "cohere" => ProviderId::Cohere,
            "mistral" => ProviderId::Mistral,
            "ollama" => ProviderId::Ollama,
            "groq" => ProviderId::Groq,
            "replicate" => ProviderId::Replicate,
            other => ProviderId::Custom(other.to_string()),
        })
    }
}

/// Which payload variant a request kind expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFamily {
    ListModels,
    TextCompletion,
    Chat,
    Responses,
    CountTokens,
    Embedding,
    Speech,
    Transcription,
    Image,
    Batch,
    File,
    Container,
    Rerank,
    Video,
}

macro_rules! request_kinds {
    ($( $variant:ident => ($name:literal, $family:ident, streaming: $streaming:literal) ),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum RequestKind {
            $( $variant, )+
        }

        impl RequestKind {
            pub fn as_str(&self) -> &'static str {
                match self { $( RequestKind::$variant => $name, )+ }
            }

            pub fn family(&self) -> PayloadFamily {
                match self { $( RequestKind::$variant => PayloadFamily::$family, )+ }
            }

            pub fn is_streaming(&self) -> bool {
                match self { $( RequestKind::$variant => $streaming, )+ }
            }
        }
    };
}

request_kinds! {
    ListModels => ("list_models", ListModels, streaming: false),
    TextCompletion => ("text_completion", TextCompletion, streaming: false),
    TextCompletionStream => ("text_completion_stream", TextCompletion, streaming: true),
    Chat => ("chat", Chat, streaming: false),
    ChatStream => ("chat_stream", Chat, streaming: true),
    Responses => ("responses", Responses, streaming: false),
    ResponsesStream => ("responses_stream", Responses, streaming: true),
    CountTokens => ("count_tokens", CountTokens, streaming: false),
    Embedding => ("embedding", Embedding, streaming: false),
    Speech => ("speech", Speech, streaming: false),
    SpeechStream => ("speech_stream", Speech, streaming: true),
    Transcription => ("transcription", Transcription, streaming: false),
    TranscriptionStream => ("transcription_stream", Transcription, streaming: true),
    ImageGeneration => ("image_generation", Image, streaming: false),
    ImageGenerationStream => ("image_generation_stream", Image, streaming: true),
    ImageEdit => ("image_edit", Image, streaming: false),
    ImageEditStream => ("image_edit_stream", Image, streaming: true),
    ImageVariation => ("image_variation", Image, streaming: false),
    ImageVariationStream => ("image_variation_stream", Image, streaming: true),
    BatchCreate => ("batch_create", Batch, streaming: false),
    BatchList => ("batch_list", Batch, streaming: false),
    BatchRetrieve => ("batch_retrieve", Batch, streaming: false),
    BatchCancel => ("batch_cancel", Batch, streaming: false),
    BatchResults => ("batch_results", Batch, streaming: false),
    FileUpload => ("file_upload", File, streaming: false),
    FileList => ("file_list", File, streaming: false),
    FileRetrieve => ("file_retrieve", File, streaming: false),
    FileDelete => ("file_delete", File, streaming: false),
    FileContent => ("file_content", File, streaming: false),
    ContainerCreate => ("container_create", Container, streaming: false),
    ContainerList => ("container_list", Container, streaming: false),
    ContainerRetrieve => ("container_retrieve", Container, streaming: false),
    ContainerDelete => ("container_delete", Container, streaming: false),
    ContainerFileCreate => ("container_file_create", Container, streaming: false),
    ContainerFileList => ("container_file_list", Container, streaming: false),
    ContainerFileRetrieve => ("container_file_retrieve", Container, streaming: false),
    ContainerFileContent => ("container_file_content", Container, streaming: false),
    ContainerFileDelete => ("container_file_delete", Container, streaming: false),
    Rerank => ("rerank", Rerank, streaming: false),
    VideoGeneration => ("video_generation", Video, streaming: false),
    VideoList => ("video_list", Video, streaming: false),
    VideoRetrieve => ("video_retrieve", Video, streaming: false),
    VideoDownload => ("video_download", Video, streaming: false),
    VideoRemix => ("video_remix", Video, streaming: false),
    VideoDelete => ("video_delete", Video, streaming: false),
}

impl RequestKind {
    pub fn is_batch_op(&self) -> bool {
        self.family() == PayloadFamily::Batch
    }

    pub fn is_file_op(&self) -> bool {
        self.family() == PayloadFamily::File
    }

    pub fn is_container_op(&self) -> bool {
        self.family() == PayloadFamily::Container
    }

    pub fn is_video_op(&self) -> bool {
        self.family() == PayloadFamily::Video
    }

    /// Batch and file operations restrict key selection to batch-eligible
    /// credentials.
    pub fn requires_batch_keys(&self) -> bool {
        self.is_batch_op() || self.is_file_op()
    }

    /// Kinds whose adaptor call receives every eligible credential so it can
    /// aggregate per-key results, instead of one selected key. Everything in
    /// the batch / file / container / video families except the single-key
    /// creators, plus model listing.
    pub fn is_multi_key(&self) -> bool {
        match self {
            RequestKind::ListModels => true,
            RequestKind::BatchCreate
            | RequestKind::FileUpload
            | RequestKind::ContainerCreate
            | RequestKind::ContainerFileCreate
            | RequestKind::VideoGeneration
            | RequestKind::VideoRemix => false,
            kind => {
                kind.is_batch_op()
                    || kind.is_file_op()
                    || kind.is_container_op()
                    || kind.is_video_op()
            }
        }
    }

    /// Kinds that can carry a tool catalog and therefore participate in MCP
    /// enrichment. Audio streams never do.
    pub fn carries_tools(&self) -> bool {
        matches!(
            self,
            RequestKind::Chat
                | RequestKind::ChatStream
                | RequestKind::Responses
                | RequestKind::ResponsesStream
        )
    }

    /// Multi-key aggregator kinds skip model filtering during key selection.
    pub fn needs_model(&self) -> bool {
        !self.is_multi_key()
            && !matches!(
                self,
                RequestKind::FileUpload
                    | RequestKind::ContainerCreate
                    | RequestKind::ContainerFileCreate
            )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool the model may call, in provider-neutral form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// The message appended to the conversation after a tool call completes.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListModelsPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletionPayload {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
}

/// Input for the responses-style API. Structurally a conversation, kept as a
/// separate family because providers expose it on a different surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesPayload {
    pub input: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountTokensPayload {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPayload {
    pub input: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechPayload {
    pub input: String,
    pub voice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionPayload {
    pub file: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankPayload {
    pub query: String,
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

/// Exactly one variant is populated per request, and it must match the
/// request kind's family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPayload {
    ListModels(ListModelsPayload),
    TextCompletion(TextCompletionPayload),
    Chat(ChatPayload),
    Responses(ResponsesPayload),
    CountTokens(CountTokensPayload),
    Embedding(EmbeddingPayload),
    Speech(SpeechPayload),
    Transcription(TranscriptionPayload),
    Image(ImagePayload),
    Batch(BatchPayload),
    File(FilePayload),
    Container(ContainerPayload),
    Rerank(RerankPayload),
    Video(VideoPayload),
}

impl RequestPayload {
    pub fn family(&self) -> PayloadFamily {
        match self {
            RequestPayload::ListModels(_) => PayloadFamily::ListModels,
            RequestPayload::TextCompletion(_) => PayloadFamily::TextCompletion,
            RequestPayload::Chat(_) => PayloadFamily::Chat,
            RequestPayload::Responses(_) => PayloadFamily::Responses,
            RequestPayload::CountTokens(_) => PayloadFamily::CountTokens,
            RequestPayload::Embedding(_) => PayloadFamily::Embedding,
            RequestPayload::Speech(_) => PayloadFamily::Speech,
            RequestPayload::Transcription(_) => PayloadFamily::Transcription,
            RequestPayload::Image(_) => PayloadFamily::Image,
            RequestPayload::Batch(_) => PayloadFamily::Batch,
            RequestPayload::File(_) => PayloadFamily::File,
            RequestPayload::Container(_) => PayloadFamily::Container,
            RequestPayload::Rerank(_) => PayloadFamily::Rerank,
            RequestPayload::Video(_) => PayloadFamily::Video,
        }
    }

    pub fn as_chat(&self) -> Option<&ChatPayload> {
        match self {
            RequestPayload::Chat(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_chat_mut(&mut self) -> Option<&mut ChatPayload> {
        match self {
            RequestPayload::Chat(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_responses_mut(&mut self) -> Option<&mut ResponsesPayload> {
        match self {
            RequestPayload::Responses(p) => Some(p),
            _ => None,
        }
    }

    /// The tool catalog carried by the payload, for tool-carrying families.
    pub fn tools(&self) -> Option<&[ToolDefinition]> {
        match self {
            RequestPayload::Chat(p) => Some(&p.tools),
            RequestPayload::Responses(p) => Some(&p.tools),
            _ => None,
        }
    }
}

/// One alternative target in a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: ProviderId,
    pub model: String,
}

/// The unified request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    pub provider: ProviderId,
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fallbacks: Vec<Fallback>,
    pub payload: RequestPayload,
    /// Per-kind parameters (temperature, max tokens, output format, ...)
    /// passed through to the adaptor untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(
        kind: RequestKind,
        provider: ProviderId,
        model: impl Into<String>,
        payload: RequestPayload,
    ) -> Self {
        Request {
            kind,
            provider,
            model: model.into(),
            fallbacks: Vec::new(),
            payload,
            params: None,
        }
    }

    pub fn chat(provider: ProviderId, model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self::new(
            RequestKind::Chat,
            provider,
            model,
            RequestPayload::Chat(ChatPayload {
                messages,
                tools: Vec::new(),
            }),
        )
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Fallback>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Shallow copy retargeted at a fallback entry. The fallback list is not
    /// carried over; the fallback controller owns iteration.
    pub fn retargeted(&self, fallback: &Fallback) -> Request {
        Request {
            kind: self.kind,
            provider: fallback.provider.clone(),
            model: fallback.model.clone(),
            fallbacks: Vec::new(),
            payload: self.payload.clone(),
            params: self.params.clone(),
        }
    }

    /// Envelope validation: payload variant must match the kind, and the
    /// per-kind required fields must be present.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.payload.family() != self.kind.family() {
            return Err(GatewayError::validation(format!(
                "payload variant does not match request kind {}",
                self.kind
            )));
        }
        if self.kind.needs_model() && self.model.is_empty() {
            return Err(GatewayError::validation("model is required"));
        }
        match (&self.kind, &self.payload) {
            (_, RequestPayload::TextCompletion(p)) if p.prompt.is_empty() => {
                Err(GatewayError::validation("prompt is required"))
            }
            (_, RequestPayload::Chat(p)) if p.messages.is_empty() => {
                Err(GatewayError::validation("messages are required"))
            }
            (_, RequestPayload::Responses(p)) if p.input.is_empty() => {
                Err(GatewayError::validation("input is required"))
            }
            (_, RequestPayload::Embedding(p)) if p.input.is_empty() => {
                Err(GatewayError::validation("embedding input is required"))
            }
            (_, RequestPayload::Speech(p)) if p.input.is_empty() => {
                Err(GatewayError::validation("speech input is required"))
            }
            (_, RequestPayload::Transcription(p)) if p.file.is_empty() => {
                Err(GatewayError::validation("transcription file is required"))
            }
            (RequestKind::ImageGeneration | RequestKind::ImageGenerationStream, RequestPayload::Image(p))
                if p.prompt.as_deref().unwrap_or_default().is_empty() =>
            {
                Err(GatewayError::validation("image prompt is required"))
            }
            (
                RequestKind::ImageEdit
                | RequestKind::ImageEditStream
                | RequestKind::ImageVariation
                | RequestKind::ImageVariationStream,
                RequestPayload::Image(p),
            ) if p.image.is_none() => Err(GatewayError::validation("source image is required")),
            (RequestKind::BatchCreate, RequestPayload::Batch(p))
                if p.input_file_id.is_none() || p.endpoint.is_none() =>
            {
                Err(GatewayError::validation(
                    "batch input_file_id and endpoint are required",
                ))
            }
            (
                RequestKind::BatchRetrieve | RequestKind::BatchCancel | RequestKind::BatchResults,
                RequestPayload::Batch(p),
            ) if p.batch_id.is_none() => Err(GatewayError::validation("batch_id is required")),
            (RequestKind::FileUpload, RequestPayload::File(p)) if p.file.is_none() => {
                Err(GatewayError::validation("file content is required"))
            }
            (
                RequestKind::FileRetrieve | RequestKind::FileDelete | RequestKind::FileContent,
                RequestPayload::File(p),
            ) if p.file_id.is_none() => Err(GatewayError::validation("file_id is required")),
            (RequestKind::ContainerCreate, RequestPayload::Container(p)) if p.name.is_none() => {
                Err(GatewayError::validation("container name is required"))
            }
            (kind, RequestPayload::Container(p))
                if *kind != RequestKind::ContainerCreate
                    && *kind != RequestKind::ContainerList
                    && p.container_id.is_none() =>
            {
                Err(GatewayError::validation("container_id is required"))
            }
            (RequestKind::ContainerFileCreate, RequestPayload::Container(p)) if p.file.is_none() => {
                Err(GatewayError::validation("container file content is required"))
            }
            (_, RequestPayload::Rerank(p)) if p.query.is_empty() || p.documents.is_empty() => {
                Err(GatewayError::validation("rerank query and documents are required"))
            }
            (RequestKind::VideoGeneration | RequestKind::VideoRemix, RequestPayload::Video(p))
                if p.prompt.as_deref().unwrap_or_default().is_empty() =>
            {
                Err(GatewayError::validation("video prompt is required"))
            }
            (
                RequestKind::VideoRetrieve | RequestKind::VideoDownload | RequestKind::VideoDelete,
                RequestPayload::Video(p),
            ) if p.video_id.is_none() => Err(GatewayError::validation("video_id is required")),
            _ => Ok(()),
        }
    }
}
