use async_trait::async_trait;

use crate::context::Context;
use crate::error::GatewayError;
use crate::mcp::ToolInvocation;
use crate::requests::{ChatMessage, Request};
use crate::response::{Response, ResponseStream};

pub mod pipeline;

/// What a pre-hook decided to do with the request.
pub enum PreHookDecision {
    /// Keep going with this (possibly modified) request.
    Continue(Request),
    /// Short-circuit: answer with this response, skipping the adaptor.
    Respond(Box<Response>),
    /// Short-circuit: answer with this stream, skipping the adaptor.
    Stream(ResponseStream),
    /// Short-circuit: fail with this error as-is.
    Fail(Box<GatewayError>),
}

/// A caller-supplied hook pair around LLM dispatch.
///
/// Pre-hooks run in registration order; post-hooks run in strict reverse of
/// the pre-hooks that actually executed. A post-hook receives both the
/// current response and the current error and may transform either, recover
/// the error into a response, or invalidate the response into an error.
/// Returning a different error object transfers ownership of the old one
/// back to the pipeline, which drops it.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// An `Err` return is a hook failure: the pipeline wraps it as an
    /// internal error and short-circuits.
    async fn pre_hook(
        &self,
        ctx: &Context,
        request: Request,
    ) -> Result<PreHookDecision, Box<GatewayError>> {
        let _ = ctx;
        Ok(PreHookDecision::Continue(request))
    }

    async fn post_hook(
        &self,
        ctx: &Context,
        response: Option<Box<Response>>,
        error: Option<Box<GatewayError>>,
    ) -> (Option<Box<Response>>, Option<Box<GatewayError>>) {
        let _ = ctx;
        (response, error)
    }

    /// Called once when the plugin is removed or the gateway shuts down.
    async fn cleanup(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// What an MCP pre-hook decided to do with the tool invocation.
pub enum McpPreDecision {
    Continue(ToolInvocation),
    /// Short-circuit: this is the tool result, skip execution.
    Respond(ChatMessage),
    Fail(Box<GatewayError>),
}

/// Hook pair around server-side tool execution.
#[async_trait]
pub trait McpPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_tool_hook(
        &self,
        ctx: &Context,
        invocation: ToolInvocation,
    ) -> Result<McpPreDecision, Box<GatewayError>> {
        let _ = ctx;
        Ok(McpPreDecision::Continue(invocation))
    }

    async fn post_tool_hook(
        &self,
        ctx: &Context,
        result: Option<ChatMessage>,
        error: Option<Box<GatewayError>>,
    ) -> (Option<ChatMessage>, Option<Box<GatewayError>>) {
        let _ = ctx;
        (result, error)
    }

    async fn cleanup(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
