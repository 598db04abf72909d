//! crossbar is a request-dispatch gateway that fronts many heterogeneous LLM
//! provider backends behind one API. Callers submit typed inference requests;
//! the gateway selects a credential, routes the call through a bounded
//! per-provider worker pool, executes it with retry and fallback, and
//! optionally enriches it with plugin hooks and server-side tool calls.
//!
//! The crate deliberately stops at the adaptor seam: wire-level encoding for
//! each provider lives behind the [`providers::Provider`] trait and is not
//! part of this crate.

pub mod account;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod mcp;
pub mod plugins;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod requests;
pub mod response;
pub mod retry;
pub mod telemetry;
pub mod worker;

pub use account::{Account, StaticAccount};
pub use config::{GatewayConfig, McpConfig, ProviderConfig};
pub use context::Context;
pub use error::{ErrorType, GatewayError};
pub use gateway::Gateway;
pub use keys::{DeploymentTables, Key, KeySelector};
pub use mcp::{McpClient, McpManager, ToolInvocation};
pub use plugins::{McpPlugin, McpPreDecision, Plugin, PreHookDecision};
pub use providers::{AdaptorFactory, Provider};
pub use requests::{
    ChatMessage, Fallback, ProviderId, Request, RequestKind, RequestPayload, Role, ToolCall,
    ToolDefinition,
};
pub use response::{Response, ResponseBody, ResponseStream};
pub use telemetry::{LogTracer, NoopTracer, SpanHandle, SpanKind, SpanStatus, Tracer};
