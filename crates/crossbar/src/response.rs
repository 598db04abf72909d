use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, KeyStatus};
use crate::requests::{ChatMessage, ProviderId, RequestKind};

/// Token accounting reported by the adaptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub owned_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: u32,
    pub relevance_score: f64,
}

/// Typed response body, one variant per request family. Batch, file,
/// container and video objects are provider-shaped and carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Chat { choices: Vec<Choice> },
    Text { text: String },
    Models { models: Vec<ModelEntry> },
    TokenCount { tokens: u64 },
    Embedding { vectors: Vec<Vec<f32>> },
    Audio { audio: Vec<u8> },
    Transcript { text: String },
    Images { images: Vec<Vec<u8>> },
    Rerank { results: Vec<RerankResult> },
    Raw { value: Value },
    /// Deletion and cancel acknowledgements.
    Deleted { id: String },
}

/// Gateway metadata attached to every response, alongside whatever the
/// adaptor returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseExtra {
    pub request_kind: Option<RequestKind>,
    pub provider: Option<ProviderId>,
    pub model_requested: Option<String>,
    pub request_id: Option<String>,
    pub selected_key_id: Option<String>,
    pub selected_key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub key_statuses: Vec<KeyStatus>,
    pub latency_ms: Option<u64>,
    /// Set on the last chunk of a stream.
    #[serde(default)]
    pub stream_end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub body: ResponseBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub extra: ResponseExtra,
}

impl Response {
    pub fn new(object: impl Into<String>, model: impl Into<String>, body: ResponseBody) -> Self {
        Response {
            id: uuid::Uuid::new_v4().to_string(),
            object: object.into(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            body,
            usage: None,
            extra: ResponseExtra::default(),
        }
    }

    /// A single-choice assistant chat response.
    pub fn chat(model: impl Into<String>, message: ChatMessage) -> Self {
        Self::new(
            "chat.completion",
            model,
            ResponseBody::Chat {
                choices: vec![Choice {
                    index: 0,
                    message,
                    finish_reason: Some("stop".into()),
                }],
            },
        )
    }

    /// One chunk of a chat stream.
    pub fn chat_chunk(model: impl Into<String>, message: ChatMessage) -> Self {
        Self::new(
            "chat.completion.chunk",
            model,
            ResponseBody::Chat {
                choices: vec![Choice {
                    index: 0,
                    message,
                    finish_reason: None,
                }],
            },
        )
    }

    /// The tool calls requested by the first choice, if any.
    pub fn tool_calls(&self) -> &[crate::requests::ToolCall] {
        match &self.body {
            ResponseBody::Chat { choices } => choices
                .first()
                .map(|c| c.message.tool_calls.as_slice())
                .unwrap_or_default(),
            _ => &[],
        }
    }

    pub fn boxed(self) -> Box<Response> {
        Box::new(self)
    }
}

/// A stream of response chunks. Each element is a whole envelope; errors are
/// in-band so post-hooks can recover them.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<Box<Response>, Box<GatewayError>>> + Send>>;

/// What a dispatch ultimately resolves to.
pub enum DispatchOutcome {
    Response(Box<Response>),
    Stream(ResponseStream),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::Response(r) => f.debug_tuple("Response").field(&r.id).finish(),
            DispatchOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
