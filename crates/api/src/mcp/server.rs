//! Inbound MCP server that republishes a backend's capabilities.
//!
//! Listing methods answer from a snapshot taken at instance creation;
//! tools/call, prompts/get and resources/read forward to the backend client.
//! Backend-side list changes are not re-synced until the shared instance is
//! rebuilt.

use std::sync::Arc;

use serde_json::json;

use super::client::{McpClient, McpResult};
use super::types::*;

/// Inbound server facade over one upstream client.
pub struct McpProxyServer {
    name: String,
    version: String,
    client: Arc<McpClient>,
    tools: Vec<Tool>,
    prompts: Vec<Prompt>,
    resources: Vec<Resource>,
    resource_templates: Vec<ResourceTemplate>,
}

impl McpProxyServer {
    /// Build the server by paging through the backend's capability lists.
    /// A failing category is logged and skipped; the others still populate.
    pub async fn populate(name: &str, version: &str, client: Arc<McpClient>) -> Self {
        let mut server = Self {
            name: name.to_string(),
            version: version.to_string(),
            client,
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
        };

        if let Err(err) = server.load_tools().await {
            tracing::error!(service = %server.name, error = %err, "listing tools failed");
        }
        if let Err(err) = server.load_prompts().await {
            tracing::error!(service = %server.name, error = %err, "listing prompts failed");
        }
        if let Err(err) = server.load_resources().await {
            tracing::error!(service = %server.name, error = %err, "listing resources failed");
        }
        if let Err(err) = server.load_resource_templates().await {
            tracing::error!(service = %server.name, error = %err, "listing resource templates failed");
        }

        tracing::info!(
            service = %server.name,
            tools = server.tools.len(),
            prompts = server.prompts.len(),
            resources = server.resources.len(),
            "populated proxy server"
        );

        server
    }

    async fn load_tools(&mut self) -> McpResult<()> {
        let mut cursor = None;
        loop {
            let page = self.client.list_tools(cursor).await?;
            self.tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }

    async fn load_prompts(&mut self) -> McpResult<()> {
        let mut cursor = None;
        loop {
            let page = self.client.list_prompts(cursor).await?;
            self.prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }

    async fn load_resources(&mut self) -> McpResult<()> {
        let mut cursor = None;
        loop {
            let page = self.client.list_resources(cursor).await?;
            self.resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }

    async fn load_resource_templates(&mut self) -> McpResult<()> {
        let mut cursor = None;
        loop {
            let page = self.client.list_resource_templates(cursor).await?;
            self.resource_templates.extend(page.resource_templates);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    /// Dispatch one inbound JSON-RPC message. Notifications return `None`.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            // Client-side lifecycle notifications are accepted and dropped.
            tracing::debug!(service = %self.name, method = %request.method, "notification");
            return None;
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => {
                let result = InitializeResult {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: Capabilities {
                        tools: Some(ToolsCapability::default()),
                        prompts: Some(PromptsCapability::default()),
                        resources: Some(ResourcesCapability::default()),
                        logging: None,
                        sampling: None,
                    },
                    server_info: ServerInfo {
                        name: self.name.clone(),
                        version: self.version.clone(),
                    },
                    instructions: None,
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcResponse::success(id, value),
                    Err(err) => JsonRpcResponse::error(id, JsonRpcError::internal_error(err.to_string())),
                }
            }

            "ping" => JsonRpcResponse::success(id, json!({})),

            "tools/list" => JsonRpcResponse::success(
                id,
                json!(ToolsListResult {
                    tools: self.tools.clone(),
                    next_cursor: None,
                }),
            ),

            "prompts/list" => JsonRpcResponse::success(
                id,
                json!(PromptsListResult {
                    prompts: self.prompts.clone(),
                    next_cursor: None,
                }),
            ),

            "resources/list" => JsonRpcResponse::success(
                id,
                json!(ResourcesListResult {
                    resources: self.resources.clone(),
                    next_cursor: None,
                }),
            ),

            "resources/templates/list" => JsonRpcResponse::success(
                id,
                json!(ResourceTemplatesListResult {
                    resource_templates: self.resource_templates.clone(),
                    next_cursor: None,
                }),
            ),

            "tools/call" | "prompts/get" | "resources/read" => {
                self.forward(id, &request.method, request.params).await
            }

            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        };

        Some(response)
    }

    /// Forward a request to the backend, preserving its result or error.
    async fn forward(
        &self,
        id: Option<JsonRpcId>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        match self.client.request_raw(method, params).await {
            Ok(mut backend_response) => {
                backend_response.id = id;
                backend_response
            }
            Err(err) => {
                tracing::error!(service = %self.name, method, error = %err, "forward failed");
                JsonRpcResponse::error(id, JsonRpcError::internal_error(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::{StdioSpec, TransportSpec};
    use std::collections::HashMap;

    // A backend that answers every listing with one page and echoes tool calls.
    fn scripted_backend() -> Arc<McpClient> {
        let script = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"hello","inputSchema":{}}]}}\n' "$id" ;;
    *prompts/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"prompts":[]}}\n' "$id" ;;
    *resources/templates/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"resourceTemplates":[]}}\n' "$id" ;;
    *resources/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[]}}\n' "$id" ;;
    *tools/call*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;
        let spec = StdioSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            envs: HashMap::new(),
        };
        Arc::new(McpClient::connect("scripted", TransportSpec::Stdio(spec)).unwrap())
    }

    #[tokio::test]
    async fn test_populate_and_snapshot_list() {
        let client = scripted_backend();
        let server = McpProxyServer::populate("svc", "1.0.0", client.clone()).await;
        assert_eq!(server.tool_count(), 1);

        let request = JsonRpcRequest::new(9, "tools/list", None);
        let response = server.handle(request).await.expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["tools"][0]["name"], "hello");

        client.close().await;
    }

    #[tokio::test]
    async fn test_initialize_and_ping_answered_locally() {
        let client = scripted_backend();
        let server = McpProxyServer::populate("svc", "1.0.0", client.clone()).await;

        let init = server
            .handle(JsonRpcRequest::new(1, "initialize", None))
            .await
            .unwrap();
        assert_eq!(init.result.unwrap()["serverInfo"]["name"], "svc");

        let pong = server
            .handle(JsonRpcRequest::new(2, "ping", None))
            .await
            .unwrap();
        assert!(pong.error.is_none());

        client.close().await;
    }

    #[tokio::test]
    async fn test_tool_call_forwards_and_rewrites_id() {
        let client = scripted_backend();
        let server = McpProxyServer::populate("svc", "1.0.0", client.clone()).await;

        let request = JsonRpcRequest::new(
            42,
            "tools/call",
            Some(json!({"name": "hello", "arguments": {}})),
        );
        let response = server.handle(request).await.unwrap();
        assert_eq!(response.id, Some(JsonRpcId::Number(42)));
        assert_eq!(response.result.unwrap()["content"][0]["text"], "hi");

        client.close().await;
    }

    #[tokio::test]
    async fn test_unknown_method_and_notification() {
        let client = scripted_backend();
        let server = McpProxyServer::populate("svc", "1.0.0", client.clone()).await;

        let unknown = server
            .handle(JsonRpcRequest::new(5, "logging/setLevel", None))
            .await
            .unwrap();
        assert_eq!(unknown.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);

        let notification =
            JsonRpcRequest::notification("notifications/initialized", None);
        assert!(server.handle(notification).await.is_none());

        client.close().await;
    }
}
