use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::requests::ProviderId;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 0;
pub const DEFAULT_RETRY_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 5_000;

/// How one provider's worker cohort and retry policy are shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Number of workers consuming this provider's queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue depth before enqueue blocks (or drops, see
    /// [`GatewayConfig::drop_excess_requests`]).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub retry_backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// For custom providers: which wire family the adaptor speaks.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_provider: Option<ProviderId>,
    #[serde(default)]
    pub send_back_raw_request: bool,
    #[serde(default)]
    pub send_back_raw_response: bool,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_INITIAL_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MAX_MS
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            concurrency: DEFAULT_CONCURRENCY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_initial_ms: DEFAULT_RETRY_BACKOFF_INITIAL_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
            base_provider: None,
            send_back_raw_request: false,
            send_back_raw_response: false,
        }
    }
}

impl ProviderConfig {
    pub fn retry_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_initial_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

/// MCP subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Hard deadline for one tool execution.
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// Maximum number of LLM round-trips in the agent loop.
    #[serde(default = "default_max_agent_depth")]
    pub max_agent_depth: u32,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_max_agent_depth() -> u32 {
    10
}

impl Default for McpConfig {
    fn default() -> Self {
        McpConfig {
            tool_timeout_ms: default_tool_timeout_ms(),
            max_agent_depth: default_max_agent_depth(),
        }
    }
}

impl McpConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

/// Gateway-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// When true, enqueue on a full queue fails immediately instead of
    /// blocking. Runtime-settable through the admin API.
    #[serde(default)]
    pub drop_excess_requests: bool,
    #[serde(default = "default_pipeline_pool_size")]
    pub pipeline_pool_size: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mcp: Option<McpConfig>,
    #[serde(default = "default_list_models_page_size")]
    pub list_models_page_size: u32,
    /// Safety cap on pagination during list-models fan-outs.
    #[serde(default = "default_list_models_max_pages")]
    pub list_models_max_pages: u32,
}

fn default_pipeline_pool_size() -> usize {
    64
}

fn default_list_models_page_size() -> u32 {
    100
}

fn default_list_models_max_pages() -> u32 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            drop_excess_requests: false,
            pipeline_pool_size: default_pipeline_pool_size(),
            mcp: None,
            list_models_page_size: default_list_models_page_size(),
            list_models_max_pages: default_list_models_max_pages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_deserializes_with_defaults() {
        let cfg: ProviderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.retry_backoff_initial(), Duration::from_millis(500));
        assert!(cfg.base_provider.is_none());
    }

    #[test]
    fn gateway_config_roundtrip() {
        let cfg = GatewayConfig {
            drop_excess_requests: true,
            mcp: Some(McpConfig::default()),
            ..GatewayConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert!(parsed.drop_excess_requests);
        assert!(parsed.mcp.is_some());
    }
}
