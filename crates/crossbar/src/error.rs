use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::requests::{ProviderId, RequestKind};

/// Sentinel message used when the transport layer could not perform the
/// request at all. Adaptors must use this exact message so the retry engine
/// can classify the failure.
pub const ERR_PERFORMING_REQUEST: &str = "error performing the HTTP request";

/// Sentinel message for a transport-level network failure.
pub const ERR_NETWORK: &str = "network error";

/// Status codes that always warrant a retry.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// Message / type fragments that identify a rate-limit response regardless of
/// status code.
pub const RATE_LIMIT_TOKENS: &[&str] = &[
    "rate_limit_exceeded",
    "rate limit exceeded",
    "rate-limited",
    "too_many_requests",
    "too many requests",
    "insufficient_quota",
    "slow_down",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The caller's context was cancelled. Never retried, never falls back.
    Cancelled,
    RateLimited,
    Validation,
    NotConfigured,
    ShuttingDown,
    QueueDropped,
    Network,
    Hook,
    Reconfigure,
    Unsupported,
    Provider,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Cancelled => "request_cancelled",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::Validation => "invalid_request",
            ErrorType::NotConfigured => "not_configured",
            ErrorType::ShuttingDown => "provider_shutting_down",
            ErrorType::QueueDropped => "request_dropped",
            ErrorType::Network => "network_error",
            ErrorType::Hook => "plugin_hook_error",
            ErrorType::Reconfigure => "reconfigure_failed",
            ErrorType::Unsupported => "unsupported_operation",
            ErrorType::Provider => "provider_error",
        }
    }
}

/// Outcome of one credential during a multi-key fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key_id: String,
    pub key_name: String,
    pub success: bool,
    pub message: Option<String>,
}

/// Request identification attached to every terminal error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorExtra {
    pub request_kind: Option<RequestKind>,
    pub provider: Option<ProviderId>,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub key_statuses: Vec<KeyStatus>,
    pub latency_ms: Option<u64>,
}

/// The gateway's error envelope.
///
/// `is_internal` distinguishes errors raised by the gateway itself (hook
/// failures, shutdown, validation) from errors relayed from a provider; the
/// retry engine never retries internal errors. `forbid_fallbacks` pins the
/// caller to this error even when a fallback chain is configured.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub is_internal: bool,
    pub status_code: Option<u16>,
    pub error_type: Option<ErrorType>,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub forbid_fallbacks: bool,
    pub extra: ErrorExtra,
}

impl GatewayError {
    fn base(message: impl Into<String>) -> Self {
        GatewayError {
            is_internal: false,
            status_code: None,
            error_type: None,
            message: message.into(),
            cause: None,
            forbid_fallbacks: false,
            extra: ErrorExtra::default(),
        }
    }

    /// An error with no status, no type, no message and no cause. Post-hooks
    /// that return such an error alongside a response are treated as having
    /// recovered the call.
    pub fn empty() -> Self {
        Self::base("")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError {
            is_internal: true,
            ..Self::base(message)
        }
    }

    pub fn cancelled() -> Self {
        GatewayError {
            is_internal: false,
            error_type: Some(ErrorType::Cancelled),
            ..Self::base("request cancelled")
        }
    }

    pub fn cancelled_waiting_for_queue() -> Self {
        GatewayError {
            error_type: Some(ErrorType::Cancelled),
            ..Self::base("request cancelled while waiting for queue space")
        }
    }

    pub fn shutting_down(provider: &ProviderId) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::ShuttingDown),
            ..Self::base(format!("provider {provider} is shutting down"))
        }
    }

    pub fn queue_full(provider: &ProviderId) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::QueueDropped),
            ..Self::base(format!("request dropped: queue for {provider} is full"))
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::Validation),
            ..Self::base(message)
        }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::NotConfigured),
            ..Self::base(message)
        }
    }

    pub fn hook(message: impl Into<String>) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::Hook),
            ..Self::base(message)
        }
    }

    pub fn reconfigure(provider: &ProviderId) -> Self {
        GatewayError {
            is_internal: true,
            error_type: Some(ErrorType::Reconfigure),
            ..Self::base(format!("request failed during reconfigure of {provider}"))
        }
    }

    pub fn unsupported(kind: RequestKind, provider: &ProviderId) -> Self {
        GatewayError {
            error_type: Some(ErrorType::Unsupported),
            ..Self::base(format!("{provider} does not support {kind}"))
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        GatewayError {
            error_type: Some(ErrorType::Network),
            ..Self::base(message)
        }
    }

    pub fn provider(status_code: u16, message: impl Into<String>) -> Self {
        GatewayError {
            status_code: Some(status_code),
            error_type: Some(ErrorType::Provider),
            ..Self::base(message)
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        GatewayError {
            status_code: Some(429),
            error_type: Some(ErrorType::RateLimited),
            ..Self::base(message)
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_forbid_fallbacks(mut self) -> Self {
        self.forbid_fallbacks = true;
        self
    }

    pub fn boxed(self) -> Box<GatewayError> {
        Box::new(self)
    }

    /// Stamps request identification onto the error, without clobbering
    /// values an adaptor already filled in.
    pub fn attach_request_info(
        &mut self,
        kind: RequestKind,
        provider: &ProviderId,
        model: &str,
    ) -> &mut Self {
        self.extra.request_kind.get_or_insert(kind);
        if self.extra.provider.is_none() {
            self.extra.provider = Some(provider.clone());
        }
        if self.extra.model.is_none() && !model.is_empty() {
            self.extra.model = Some(model.to_string());
        }
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.error_type == Some(ErrorType::Cancelled)
    }

    /// No status, no type, empty message, no cause. Used by the post-hook
    /// terminal logic: an empty error next to a response means recovery.
    pub fn is_empty(&self) -> bool {
        self.status_code.is_none()
            && self.error_type.is_none()
            && self.message.is_empty()
            && self.cause.is_none()
    }

    pub fn is_rate_limit(&self) -> bool {
        if self.error_type == Some(ErrorType::RateLimited) {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        RATE_LIMIT_TOKENS.iter().any(|t| message.contains(t))
    }

    /// Retry classification. Internal errors and cancellations are terminal;
    /// the retryable set is a closed list of transient statuses plus
    /// rate-limit tokens and the transport sentinels.
    pub fn is_retryable(&self) -> bool {
        if self.is_internal || self.is_cancellation() {
            return false;
        }
        if let Some(code) = self.status_code {
            if RETRYABLE_STATUS_CODES.contains(&code) {
                return true;
            }
        }
        if self.is_rate_limit() {
            return true;
        }
        self.message == ERR_PERFORMING_REQUEST || self.message == ERR_NETWORK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_are_the_closed_set() {
        for code in [408u16, 425, 429, 500, 502, 503, 504] {
            assert!(GatewayError::provider(code, "boom").is_retryable(), "{code}");
        }
        for code in [400u16, 401, 403, 404, 422] {
            assert!(!GatewayError::provider(code, "boom").is_retryable(), "{code}");
        }
    }

    #[test]
    fn rate_limit_tokens_match_without_status() {
        let err = GatewayError::base("upstream said: Rate limit exceeded, slow down");
        assert!(err.is_retryable());
    }

    #[test]
    fn network_sentinels_are_retryable() {
        assert!(GatewayError::base(ERR_PERFORMING_REQUEST).is_retryable());
        assert!(GatewayError::base(ERR_NETWORK).is_retryable());
        assert!(!GatewayError::base("network errors happened").is_retryable());
    }

    #[test]
    fn internal_and_cancelled_are_terminal() {
        assert!(!GatewayError::hook("plugin exploded").is_retryable());
        assert!(!GatewayError::cancelled().is_retryable());
        let mut internal_429 = GatewayError::provider(429, "limited");
        internal_429.is_internal = true;
        assert!(!internal_429.is_retryable());
    }

    #[test]
    fn empty_error_detection() {
        assert!(GatewayError::empty().is_empty());
        assert!(!GatewayError::base("x").is_empty());
        assert!(!GatewayError::provider(500, "").is_empty());
    }

    #[test]
    fn attach_request_info_does_not_clobber() {
        let mut err = GatewayError::provider(500, "boom");
        err.extra.model = Some("gpt-4o".into());
        err.attach_request_info(RequestKind::Chat, &ProviderId::Anthropic, "claude-3-5-sonnet");
        assert_eq!(err.extra.model.as_deref(), Some("gpt-4o"));
        assert_eq!(err.extra.provider, Some(ProviderId::Anthropic));
        assert_eq!(err.extra.request_kind, Some(RequestKind::Chat));
    }
}
