use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::GatewayError;
use crate::requests::{ChatMessage, ToolCall, ToolDefinition};

pub mod orchestrator;

pub use orchestrator::{McpHookRunner, McpManager};

/// One tool call to execute server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl From<&ToolCall> for ToolInvocation {
    fn from(call: &ToolCall) -> Self {
        ToolInvocation {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// A connected tool server. Implementations own transport and session state;
/// the orchestrator only lists tools and executes calls.
#[async_trait]
pub trait McpClient: Send + Sync {
    fn name(&self) -> &str;

    async fn tools(&self) -> Result<Vec<ToolDefinition>, Box<GatewayError>>;

    /// Executes one tool call and renders the result as the tool message to
    /// append to the conversation.
    async fn call_tool(
        &self,
        ctx: &Context,
        invocation: &ToolInvocation,
    ) -> Result<ChatMessage, Box<GatewayError>>;

    async fn reconnect(&self) -> Result<(), Box<GatewayError>> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Box<GatewayError>> {
        Ok(())
    }
}
