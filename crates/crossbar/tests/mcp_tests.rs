mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{chat_request, harness_with_config, key};
use crossbar::{
    ChatMessage, Context, ErrorType, GatewayConfig, GatewayError, McpClient, McpConfig, McpPlugin,
    McpPreDecision, ProviderConfig, ProviderId, Request, RequestKind, RequestPayload, Response,
    Role, ToolCall, ToolDefinition, ToolInvocation,
};

fn openai() -> ProviderId {
    ProviderId::OpenAi
}

fn mcp_gateway_config() -> GatewayConfig {
    GatewayConfig {
        mcp: Some(McpConfig::default()),
        ..GatewayConfig::default()
    }
}

fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("{name} tool"),
        parameters: serde_json::json!({ "type": "object" }),
    }
}

struct MockMcpClient {
    name: String,
    tools: Vec<ToolDefinition>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockMcpClient {
    fn new(name: &str, tools: Vec<ToolDefinition>) -> Arc<Self> {
        Arc::new(MockMcpClient {
            name: name.to_string(),
            tools,
            calls: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    fn slow(name: &str, tools: Vec<ToolDefinition>, delay: Duration) -> Arc<Self> {
        Arc::new(MockMcpClient {
            name: name.to_string(),
            tools,
            calls: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl McpClient for MockMcpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tools(&self) -> Result<Vec<ToolDefinition>, Box<GatewayError>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        _ctx: &Context,
        invocation: &ToolInvocation,
    ) -> Result<ChatMessage, Box<GatewayError>> {
        self.calls.lock().unwrap().push(invocation.name.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ChatMessage::tool_result(
            invocation.id.clone(),
            format!("result:{}", invocation.name),
        ))
    }
}

fn response_with_tool_calls(calls: Vec<ToolCall>) -> Box<Response> {
    Response::chat(
        "gpt-4o",
        ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: calls,
            tool_call_id: None,
        },
    )
    .boxed()
}

#[tokio::test]
async fn agent_loop_executes_tools_and_reinvokes_the_model() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    let client = MockMcpClient::new("search", vec![tool("lookup"), tool("fetch")]);
    h.gateway.add_mcp_client(client.clone()).unwrap();

    let initial = response_with_tool_calls(vec![
        ToolCall {
            id: "call-1".into(),
            name: "lookup".into(),
            arguments: serde_json::json!({ "q": "weather" }),
        },
        ToolCall {
            id: "call-2".into(),
            name: "fetch".into(),
            arguments: serde_json::json!({ "url": "x" }),
        },
    ]);

    let final_response = h
        .gateway
        .run_agent(None, chat_request(openai(), "gpt-4o"), initial)
        .await
        .expect("agent loop completes");

    assert_eq!(client.call_count(), 2);
    // One re-invocation of the model after the tool round.
    assert_eq!(h.mock(&openai()).call_count(), 1);
    assert!(final_response.tool_calls().is_empty());
}

#[tokio::test]
async fn agent_loop_rejects_non_conversational_kinds() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;

    let request = Request::new(
        RequestKind::Embedding,
        openai(),
        "text-embedding-3-small",
        RequestPayload::Embedding(crossbar::requests::EmbeddingPayload {
            input: vec!["x".into()],
        }),
    );
    let error = h
        .gateway
        .run_agent(None, request, response_with_tool_calls(vec![]))
        .await
        .unwrap_err();
    assert!(error.message.contains("unsupported MCP request type"));
}

#[tokio::test]
async fn merge_tools_unions_and_dedupes_by_name() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    let client = MockMcpClient::new("search", vec![tool("lookup"), tool("mine")]);
    h.gateway.add_mcp_client(client).unwrap();

    let mut request = chat_request(openai(), "gpt-4o");
    if let RequestPayload::Chat(chat) = &mut request.payload {
        chat.tools.push(tool("mine"));
    }

    let ctx = h.ctx();
    let merged = h
        .gateway
        .mcp_manager()
        .unwrap()
        .merge_tools(&ctx, request)
        .await;

    let tools = merged.payload.tools().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["mine", "lookup"]);
}

#[tokio::test]
async fn merge_tools_honors_include_filters() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    h.gateway
        .add_mcp_client(MockMcpClient::new("search", vec![tool("lookup")]))
        .unwrap();
    h.gateway
        .add_mcp_client(MockMcpClient::new("files", vec![tool("read_file")]))
        .unwrap();

    let ctx = h.ctx();
    ctx.set_include_clients(Some(vec!["files".into()]));
    let merged = h
        .gateway
        .mcp_manager()
        .unwrap()
        .merge_tools(&ctx, chat_request(openai(), "gpt-4o"))
        .await;
    let names: Vec<&str> = merged.payload.tools().unwrap().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["read_file"]);

    let ctx = h.ctx();
    ctx.set_include_tools(Some(vec!["lookup".into()]));
    let merged = h
        .gateway
        .mcp_manager()
        .unwrap()
        .merge_tools(&ctx, chat_request(openai(), "gpt-4o"))
        .await;
    let names: Vec<&str> = merged.payload.tools().unwrap().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["lookup"]);
}

#[tokio::test]
async fn tool_execution_times_out() {
    let config = GatewayConfig {
        mcp: Some(McpConfig {
            tool_timeout_ms: 50,
            ..McpConfig::default()
        }),
        ..GatewayConfig::default()
    };
    let h = harness_with_config(
        config,
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    h.gateway
        .add_mcp_client(MockMcpClient::slow(
            "slow",
            vec![tool("lookup")],
            Duration::from_millis(300),
        ))
        .unwrap();

    let ctx = h.ctx();
    let error = h
        .gateway
        .execute_mcp_tool(
            &ctx,
            ToolInvocation {
                id: "call-1".into(),
                name: "lookup".into(),
                arguments: serde_json::json!({}),
            },
        )
        .await
        .unwrap_err();
    assert!(error.message.contains("timed out"), "{}", error.message);
}

#[tokio::test]
async fn mcp_pre_hook_short_circuits_tool_execution() {
    struct CachedTool;

    #[async_trait]
    impl McpPlugin for CachedTool {
        fn name(&self) -> &str {
            "cached-tool"
        }

        async fn pre_tool_hook(
            &self,
            _ctx: &Context,
            invocation: ToolInvocation,
        ) -> Result<McpPreDecision, Box<GatewayError>> {
            Ok(McpPreDecision::Respond(ChatMessage::tool_result(
                invocation.id,
                "cached result",
            )))
        }
    }

    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    let client = MockMcpClient::new("search", vec![tool("lookup")]);
    h.gateway.add_mcp_client(client.clone()).unwrap();
    h.gateway.add_mcp_plugin(Arc::new(CachedTool)).unwrap();

    let ctx = h.ctx();
    let message = h
        .gateway
        .execute_mcp_tool(
            &ctx,
            ToolInvocation {
                id: "call-1".into(),
                name: "lookup".into(),
                arguments: serde_json::json!({}),
            },
        )
        .await
        .expect("short-circuited tool result");

    assert_eq!(message.content.as_deref(), Some("cached result"));
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn unknown_tool_is_not_configured() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;

    let ctx = h.ctx();
    let error = h
        .gateway
        .execute_mcp_tool(
            &ctx,
            ToolInvocation {
                id: "call-1".into(),
                name: "missing".into(),
                arguments: serde_json::json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.error_type, Some(ErrorType::NotConfigured));
}

#[tokio::test]
async fn mcp_client_admin_rejects_duplicates_and_unknowns() {
    let h = harness_with_config(
        mcp_gateway_config(),
        vec![(openai(), ProviderConfig::default(), vec![key("k1")])],
    )
    .await;
    h.gateway
        .add_mcp_client(MockMcpClient::new("search", vec![tool("lookup")]))
        .unwrap();

    let duplicate = h
        .gateway
        .add_mcp_client(MockMcpClient::new("search", vec![]))
        .unwrap_err();
    assert_eq!(duplicate.error_type, Some(ErrorType::Validation));

    assert!(h.gateway.remove_mcp_client("absent").await.is_err());
    assert!(h.gateway.remove_mcp_client("search").await.is_ok());
}
