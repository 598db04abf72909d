use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::config::McpConfig;
use crate::context::Context;
use crate::error::GatewayError;
use crate::mcp::{McpClient, ToolInvocation};
use crate::plugins::pipeline::{McpPreResult, PluginPipeline};
use crate::plugins::McpPlugin;
use crate::pool::Pool;
use crate::requests::{ChatMessage, Request, RequestKind, RequestPayload};
use crate::response::Response;

/// The pipeline pool and MCP hook snapshot a tool execution runs against.
pub struct McpHookRunner<'a> {
    pub pipelines: &'a Pool<PluginPipeline>,
    pub plugins: Vec<Arc<dyn McpPlugin>>,
}

/// Holds the connected tool servers and drives tool-catalog merging, tool
/// execution, and the agent loop.
pub struct McpManager {
    clients: ArcSwap<Vec<Arc<dyn McpClient>>>,
    config: McpConfig,
}

impl McpManager {
    pub fn new(config: McpConfig) -> Self {
        McpManager {
            clients: ArcSwap::from_pointee(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients
            .load()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn add_client(&self, client: Arc<dyn McpClient>) -> Result<(), Box<GatewayError>> {
        let current = self.clients.load_full();
        if current.iter().any(|c| c.name() == client.name()) {
            return Err(GatewayError::validation(format!(
                "mcp client {} already registered",
                client.name()
            ))
            .boxed());
        }
        let mut next = current.as_ref().clone();
        next.push(client);
        self.clients.store(Arc::new(next));
        Ok(())
    }

    pub async fn remove_client(&self, name: &str) -> Result<(), Box<GatewayError>> {
        let current = self.clients.load_full();
        let Some(index) = current.iter().position(|c| c.name() == name) else {
            return Err(
                GatewayError::not_configured(format!("mcp client {name} not found")).boxed(),
            );
        };
        let mut next = current.as_ref().clone();
        let removed = next.remove(index);
        self.clients.store(Arc::new(next));
        if let Err(error) = removed.cleanup().await {
            warn!(client = name, error = %error, "mcp client cleanup failed");
        }
        Ok(())
    }

    pub async fn reconnect_client(&self, name: &str) -> Result<(), Box<GatewayError>> {
        let clients = self.clients.load_full();
        let Some(client) = clients.iter().find(|c| c.name() == name) else {
            return Err(
                GatewayError::not_configured(format!("mcp client {name} not found")).boxed(),
            );
        };
        client.reconnect().await
    }

    pub async fn cleanup(&self) {
        let clients = self.clients.swap(Arc::new(Vec::new()));
        for client in clients.iter() {
            if let Err(error) = client.cleanup().await {
                warn!(client = client.name(), error = %error, "mcp client cleanup failed");
            }
        }
    }

    /// Unions the reachable tool catalog into the request, honoring the
    /// context's include filters and leaving caller-supplied tools first.
    /// Duplicate function names are skipped.
    pub async fn merge_tools(&self, ctx: &Context, mut request: Request) -> Request {
        let clients = self.clients.load_full();
        if clients.is_empty() {
            return request;
        }
        let include_clients = ctx.include_clients();
        let include_tools = ctx.include_tools();

        let mut discovered = Vec::new();
        for client in clients.iter() {
            if let Some(allowed) = &include_clients {
                if !allowed.iter().any(|n| n == client.name()) {
                    continue;
                }
            }
            match client.tools().await {
                Ok(tools) => discovered.extend(tools),
                Err(error) => {
                    warn!(client = client.name(), error = %error, "tool discovery failed");
                }
            }
        }
        if let Some(allowed) = &include_tools {
            discovered.retain(|t| allowed.iter().any(|n| n == &t.name));
        }

        let tools = match &mut request.payload {
            RequestPayload::Chat(chat) => Some(&mut chat.tools),
            RequestPayload::Responses(responses) => Some(&mut responses.tools),
            _ => None,
        };
        if let Some(tools) = tools {
            for tool in discovered {
                if !tools.iter().any(|existing| existing.name == tool.name) {
                    tools.push(tool);
                }
            }
        }
        request
    }

    /// Executes one tool call through the MCP hook chain.
    pub async fn execute_tool(
        &self,
        ctx: &Context,
        hooks: &McpHookRunner<'_>,
        invocation: ToolInvocation,
    ) -> Result<ChatMessage, Box<GatewayError>> {
        ctx.ensure_request_id();

        let mut pipeline = hooks.pipelines.acquire();
        pipeline.bind(Vec::new(), hooks.plugins.clone());

        let invocation = match pipeline.run_mcp_pre_hooks(ctx, invocation).await {
            McpPreResult::Continue(invocation) => invocation,
            McpPreResult::ShortCircuitResult(message) => {
                let (message, error) = pipeline.run_mcp_post_hooks(ctx, Some(message), None).await;
                hooks.pipelines.release(pipeline);
                return finish_tool(message, error);
            }
            McpPreResult::ShortCircuitError(error) => {
                let (message, error) = pipeline.run_mcp_post_hooks(ctx, None, Some(error)).await;
                hooks.pipelines.release(pipeline);
                return finish_tool(message, error);
            }
        };

        let executed = self.call_client(ctx, &invocation).await;
        let (message, error) = match executed {
            Ok(message) => pipeline.run_mcp_post_hooks(ctx, Some(message), None).await,
            Err(error) => pipeline.run_mcp_post_hooks(ctx, None, Some(error)).await,
        };
        hooks.pipelines.release(pipeline);
        finish_tool(message, error)
    }

    async fn call_client(
        &self,
        ctx: &Context,
        invocation: &ToolInvocation,
    ) -> Result<ChatMessage, Box<GatewayError>> {
        let clients = self.clients.load_full();
        let mut resolved = None;
        for client in clients.iter() {
            match client.tools().await {
                Ok(tools) if tools.iter().any(|t| t.name == invocation.name) => {
                    resolved = Some(client.clone());
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(client = client.name(), error = %error, "tool discovery failed");
                }
            }
        }
        let Some(client) = resolved else {
            return Err(GatewayError::not_configured(format!(
                "no mcp client serves tool {}",
                invocation.name
            ))
            .boxed());
        };

        debug!(tool = %invocation.name, client = client.name(), "executing tool");
        match tokio::time::timeout(self.config.tool_timeout(), client.call_tool(ctx, invocation))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::internal(format!(
                "tool {} timed out after {:?}",
                invocation.name,
                self.config.tool_timeout()
            ))
            .boxed()),
        }
    }

    /// Drives the tool loop to fixed point: execute every tool call in the
    /// response, append the tool messages, re-invoke the model, and repeat
    /// until the response carries no tool calls or the depth cap is hit.
    pub async fn run_agent<F, Fut>(
        &self,
        ctx: &Context,
        hooks: &McpHookRunner<'_>,
        initial_request: &Request,
        initial_response: Box<Response>,
        llm_caller: F,
    ) -> Result<Box<Response>, Box<GatewayError>>
    where
        F: Fn(Request) -> Fut,
        Fut: Future<Output = Result<Box<Response>, Box<GatewayError>>>,
    {
        if !matches!(initial_request.kind, RequestKind::Chat | RequestKind::Responses) {
            return Err(GatewayError::validation(format!(
                "unsupported MCP request type {}",
                initial_request.kind
            ))
            .boxed());
        }

        let mut conversation = initial_request.clone();
        let mut response = initial_response;
        let mut depth = 0;
        while !response.tool_calls().is_empty() {
            if depth >= self.config.max_agent_depth {
                debug!(depth, "agent loop depth cap reached");
                break;
            }
            depth += 1;

            let calls: Vec<ToolInvocation> =
                response.tool_calls().iter().map(ToolInvocation::from).collect();
            append_assistant_turn(&mut conversation, &response);
            for invocation in calls {
                let id = invocation.id.clone();
                let message = self.execute_tool(ctx, hooks, invocation).await?;
                let message = if message.tool_call_id.is_none() {
                    ChatMessage {
                        tool_call_id: Some(id),
                        ..message
                    }
                } else {
                    message
                };
                append_message(&mut conversation, message);
            }
            response = llm_caller(conversation.clone()).await?;
        }
        Ok(response)
    }
}

fn finish_tool(
    message: Option<ChatMessage>,
    error: Option<Box<GatewayError>>,
) -> Result<ChatMessage, Box<GatewayError>> {
    match (message, error) {
        (Some(message), None) => Ok(message),
        (Some(message), Some(error)) if error.is_empty() => {
            drop(error);
            Ok(message)
        }
        (_, Some(error)) => Err(error),
        (None, None) => Err(GatewayError::internal("tool execution produced no result").boxed()),
    }
}

fn append_assistant_turn(conversation: &mut Request, response: &Response) {
    if let crate::response::ResponseBody::Chat { choices } = &response.body {
        if let Some(choice) = choices.first() {
            append_message(conversation, choice.message.clone());
        }
    }
}

fn append_message(conversation: &mut Request, message: ChatMessage) {
    match &mut conversation.payload {
        RequestPayload::Chat(chat) => chat.messages.push(message),
        RequestPayload::Responses(responses) => responses.input.push(message),
        _ => {}
    }
}
