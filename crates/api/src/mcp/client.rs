//! MCP Client for Upstream Connections
//!
//! One client per backend instance, speaking JSON-RPC over a stdio child
//! process, a remote SSE stream, or a streamable HTTP endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::sse::{parse_sse_body, SseParser};
use super::types::*;

/// Timeout for MCP requests (30 seconds)
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the endpoint event after opening an SSE stream
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keep-alive pings for remote transports
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Error type for MCP client operations
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("MCP server returned error: {0}")]
    Mcp(String),

    #[error("Transport not started")]
    NotStarted,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Process spawn failed: {0}")]
    Process(String),
}

/// Result type for MCP client operations
pub type McpResult<T> = Result<T, McpClientError>;

/// Stdio backend launch description.
#[derive(Debug, Clone)]
pub struct StdioSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Merged on top of the inherited process environment.
    pub envs: HashMap<String, String>,
}

/// Remote backend description (SSE or streamable HTTP).
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Transport selection for an upstream MCP connection.
#[derive(Debug, Clone)]
pub enum TransportSpec {
    Stdio(StdioSpec),
    Sse(RemoteSpec),
    StreamableHttp(RemoteSpec),
}

/// Parse a response body that may be plain JSON or SSE-framed
/// ("event: message\ndata: {...}"); some streamable HTTP servers use either.
fn parse_response_body(body: &str) -> McpResult<JsonRpcResponse> {
    let trimmed = body.trim();

    if trimmed.starts_with("event:") || trimmed.starts_with("data:") {
        let mut last = None;
        for event in parse_sse_body(trimmed) {
            if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                last = Some(parsed);
            }
        }
        return last.ok_or(McpClientError::InvalidResponse);
    }

    serde_json::from_str(trimmed).map_err(McpClientError::from)
}

// =============================================================================
// Stdio transport
// =============================================================================

struct StdioProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct StdioTransport {
    process: Mutex<StdioProcess>,
}

impl StdioTransport {
    fn spawn(label: &str, spec: &StdioSpec) -> McpResult<Self> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.envs)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            McpClientError::Process(format!("failed to spawn {}: {}", spec.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::Process("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::Process("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpClientError::Process("failed to capture stderr".to_string()))?;

        // Drain stderr in the background so the child never blocks on it.
        let stderr_label = label.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.contains("ERROR") || trimmed.contains("FATAL") {
                    tracing::error!(instance = %stderr_label, stderr = %trimmed);
                } else {
                    tracing::debug!(instance = %stderr_label, stderr = %trimmed);
                }
            }
            tracing::debug!(instance = %stderr_label, "stderr stream closed");
        });

        Ok(Self {
            process: Mutex::new(StdioProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    async fn request(&self, request: &JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let mut process = self.process.lock().await;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;

        let wanted_id = request.id.clone();
        let read = tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let mut buf = String::new();
                let n = process.stdout.read_line(&mut buf).await?;
                if n == 0 {
                    return Err(McpClientError::InvalidResponse);
                }
                let trimmed = buf.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    let is_reply = response.result.is_some() || response.error.is_some();
                    if is_reply && response.id == wanted_id {
                        return Ok(response);
                    }
                }
                // Server-initiated notifications and log lines are skipped.
            }
        })
        .await;

        match read {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                tracing::error!("stdio backend read failed: {}", err);
                let _ = process.child.kill().await;
                let _ = process.child.wait().await;
                Err(err)
            }
            Err(_) => {
                tracing::error!("timeout reading from stdio backend");
                let _ = process.child.kill().await;
                let _ = process.child.wait().await;
                Err(McpClientError::Timeout)
            }
        }
    }

    async fn notify(&self, request: &JsonRpcRequest) -> McpResult<()> {
        let mut process = self.process.lock().await;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        let mut process = self.process.lock().await;
        let _ = process.child.kill().await;
        let _ = process.child.wait().await;
    }
}

// =============================================================================
// SSE transport
// =============================================================================

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

struct SseTransport {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    endpoint: StdMutex<Option<String>>,
    pending: PendingMap,
}

impl SseTransport {
    fn new(http: reqwest::Client, spec: &RemoteSpec) -> Self {
        Self {
            http,
            url: spec.url.clone(),
            headers: spec.headers.clone(),
            endpoint: StdMutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Opens the long-lived event stream, waits for the server's endpoint
    /// announcement, and spawns the reader that correlates responses.
    async fn start(&self, label: &str, cancel: &CancellationToken) -> McpResult<()> {
        let mut request = self
            .http
            .get(&self.url)
            .header("Accept", "text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(McpClientError::Mcp(format!(
                "SSE connect to {} failed with status {}",
                self.url,
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let pending = self.pending.clone();
        let base_url = reqwest::Url::parse(&self.url).ok();
        let cancel = cancel.clone();
        let reader_label = label.to_string();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            let mut endpoint_tx = Some(endpoint_tx);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(instance = %reader_label, "SSE reader cancelled");
                        break;
                    }
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            let text = String::from_utf8_lossy(&bytes);
                            for event in parser.push(&text) {
                                match event.kind() {
                                    "endpoint" => {
                                        let raw = event.data.trim().to_string();
                                        let resolved = base_url
                                            .as_ref()
                                            .and_then(|b| b.join(&raw).ok())
                                            .map(|u| u.to_string())
                                            .unwrap_or(raw);
                                        if let Some(tx) = endpoint_tx.take() {
                                            let _ = tx.send(resolved);
                                        }
                                    }
                                    "message" => {
                                        let parsed =
                                            serde_json::from_str::<JsonRpcResponse>(&event.data);
                                        if let Ok(response) = parsed {
                                            if let Some(JsonRpcId::Number(id)) = &response.id {
                                                let waiter =
                                                    pending.lock().unwrap().remove(id);
                                                if let Some(tx) = waiter {
                                                    let _ = tx.send(response);
                                                }
                                            }
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(instance = %reader_label, error = %err, "SSE stream error");
                            break;
                        }
                        None => {
                            tracing::debug!(instance = %reader_label, "SSE stream closed");
                            break;
                        }
                    }
                }
            }

            // Outstanding waiters observe the closed stream as a dropped sender.
            pending.lock().unwrap().clear();
        });

        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx)
            .await
            .map_err(|_| McpClientError::Timeout)?
            .map_err(|_| McpClientError::Mcp("SSE stream closed before endpoint event".into()))?;

        *self.endpoint.lock().unwrap() = Some(endpoint);
        Ok(())
    }

    fn message_endpoint(&self) -> McpResult<String> {
        self.endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(McpClientError::NotStarted)
    }

    async fn request(&self, request: &JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let endpoint = self.message_endpoint()?;
        let id = match &request.id {
            Some(JsonRpcId::Number(id)) => *id,
            _ => return Err(McpClientError::InvalidResponse),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut post = self
            .http
            .post(&endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(request);
        for (key, value) in &self.headers {
            post = post.header(key.as_str(), value.as_str());
        }

        let sent = post.send().await;
        match sent {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(McpClientError::Mcp(format!(
                    "message POST returned status {}",
                    response.status()
                )));
            }
            Err(err) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(err.into());
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpClientError::Mcp("SSE stream closed".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(McpClientError::Timeout)
            }
        }
    }

    async fn notify(&self, request: &JsonRpcRequest) -> McpResult<()> {
        let endpoint = self.message_endpoint()?;
        let mut post = self
            .http
            .post(&endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("Content-Type", "application/json")
            .json(request);
        for (key, value) in &self.headers {
            post = post.header(key.as_str(), value.as_str());
        }
        let response = post.send().await?;
        if !response.status().is_success() {
            return Err(McpClientError::Mcp(format!(
                "notification POST returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Streamable HTTP transport
// =============================================================================

struct HttpTransport {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    /// Session ID assigned by the server during initialize, if any.
    session: StdMutex<Option<String>>,
}

impl HttpTransport {
    fn new(http: reqwest::Client, spec: &RemoteSpec) -> Self {
        Self {
            http,
            url: spec.url.clone(),
            headers: spec.headers.clone(),
            session: StdMutex::new(None),
        }
    }

    async fn post(&self, request: &JsonRpcRequest) -> McpResult<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session.lock().unwrap().clone() {
            builder = builder.header("Mcp-Session-Id", session);
        }

        let response = builder.send().await?;

        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock().unwrap() = Some(session.to_string());
        }

        Ok(response)
    }

    async fn request(&self, request: &JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let response = self.post(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(McpClientError::Mcp(format!(
                "backend returned status {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        if body.trim().is_empty() {
            // Accepted without a body (e.g. 202 for notifications).
            return Ok(JsonRpcResponse::success(request.id.clone(), Value::Null));
        }

        parse_response_body(&body)
    }

    async fn notify(&self, request: &JsonRpcRequest) -> McpResult<()> {
        let response = self.post(request).await?;
        if !response.status().is_success() {
            return Err(McpClientError::Mcp(format!(
                "notification returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Client
// =============================================================================

enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
    Http(HttpTransport),
}

/// MCP client bound to one upstream backend.
pub struct McpClient {
    label: String,
    next_id: AtomicI64,
    transport: Transport,
}

impl McpClient {
    /// Construct the client. Stdio backends are spawned immediately; remote
    /// transports connect on `start`.
    pub fn connect(label: &str, spec: TransportSpec) -> McpResult<Self> {
        let transport = match &spec {
            TransportSpec::Stdio(stdio) => Transport::Stdio(StdioTransport::spawn(label, stdio)?),
            TransportSpec::Sse(remote) => {
                Transport::Sse(SseTransport::new(shared_http_client(), remote))
            }
            TransportSpec::StreamableHttp(remote) => {
                Transport::Http(HttpTransport::new(shared_http_client(), remote))
            }
        };

        Ok(Self {
            label: label.to_string(),
            next_id: AtomicI64::new(1),
            transport,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn transport_kind(&self) -> &'static str {
        match self.transport {
            Transport::Stdio(_) => "stdio",
            Transport::Sse(_) => "sse",
            Transport::Http(_) => "streamable_http",
        }
    }

    /// Remote transports need an explicit start before use.
    pub async fn start(&self, cancel: &CancellationToken) -> McpResult<()> {
        match &self.transport {
            Transport::Stdio(_) => Ok(()),
            Transport::Sse(sse) => sse.start(&self.label, cancel).await,
            Transport::Http(_) => Ok(()),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and return the raw JSON-RPC response.
    pub async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        match &self.transport {
            Transport::Stdio(stdio) => stdio.request(&request).await,
            Transport::Sse(sse) => sse.request(&request).await,
            Transport::Http(http) => http.request(&request).await,
        }
    }

    /// Send a request, mapping a JSON-RPC error object into `McpClientError`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let response = self.request_raw(method, params).await?;
        if let Some(error) = response.error {
            return Err(McpClientError::Mcp(error.message));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let request = JsonRpcRequest::notification(method, params);
        match &self.transport {
            Transport::Stdio(stdio) => stdio.notify(&request).await,
            Transport::Sse(sse) => sse.notify(&request).await,
            Transport::Http(http) => http.notify(&request).await,
        }
    }

    /// Initialize handshake with the backend, then the initialized
    /// notification (best effort).
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::default(),
            client_info: ClientInfo {
                name: format!("mcpgate-proxy-{}", self.label),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let result = self
            .call("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let parsed: InitializeResult = serde_json::from_value(result)?;

        if let Err(err) = self.notify("notifications/initialized", None).await {
            tracing::debug!(instance = %self.label, error = %err, "initialized notification failed");
        }

        Ok(parsed)
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.call("ping", Some(json!({}))).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> McpResult<ToolsListResult> {
        let result = self.call("tools/list", Some(cursor_params(cursor))).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> McpResult<PromptsListResult> {
        let result = self.call("prompts/list", Some(cursor_params(cursor))).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> McpResult<ResourcesListResult> {
        let result = self
            .call("resources/list", Some(cursor_params(cursor)))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> McpResult<ResourceTemplatesListResult> {
        let result = self
            .call("resources/templates/list", Some(cursor_params(cursor)))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Shut the transport down. Stdio children are killed; remote reader
    /// tasks exit via the instance cancellation token.
    pub async fn close(&self) {
        if let Transport::Stdio(stdio) = &self.transport {
            stdio.close().await;
        }
    }
}

fn cursor_params(cursor: Option<String>) -> Value {
    match cursor {
        Some(cursor) => json!({ "cursor": cursor }),
        None => json!({}),
    }
}

/// Process-wide reqwest client for remote MCP transports; connection pooling
/// is shared across instances.
fn shared_http_client() -> reqwest::Client {
    static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(10)
                .build()
                .unwrap_or_default()
        })
        .clone()
}

/// Keep-alive pinger for remote transports; exits when the owning instance's
/// context is cancelled.
pub fn spawn_pinger(client: Arc<McpClient>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so pings start after one
        // full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(instance = %client.label(), "pinger stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = client.ping().await {
                        tracing::error!(instance = %client.label(), error = %err, "ping failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json_body() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let response = parse_response_body(body).unwrap();
        assert_eq!(response.id, Some(JsonRpcId::Number(1)));
        assert!(response.result.is_some());
    }

    #[test]
    fn test_parse_sse_framed_body() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        let response = parse_response_body(body).unwrap();
        assert_eq!(response.id, Some(JsonRpcId::Number(2)));
    }

    #[test]
    fn test_parse_garbage_body() {
        assert!(parse_response_body("event: message\ndata: not-json\n\n").is_err());
        assert!(parse_response_body("not-json").is_err());
    }

    #[tokio::test]
    async fn test_stdio_request_round_trip() {
        let spec = StdioSpec {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                // Reads one request line, answers id 1 with an empty result.
                r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'"#.to_string(),
            ],
            envs: HashMap::new(),
        };

        let client = McpClient::connect("test-stdio", TransportSpec::Stdio(spec)).unwrap();
        assert_eq!(client.transport_kind(), "stdio");

        let result = client.call("ping", Some(json!({}))).await.unwrap();
        assert_eq!(result, json!({}));
        client.close().await;
    }

    #[tokio::test]
    async fn test_stdio_skips_server_notifications() {
        let spec = StdioSpec {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                concat!(
                    "read line; ",
                    r#"printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/progress"}'; "#,
                    r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"pong":true}}'"#
                )
                .to_string(),
            ],
            envs: HashMap::new(),
        };

        let client = McpClient::connect("test-stdio-skip", TransportSpec::Stdio(spec)).unwrap();
        let result = client.call("ping", Some(json!({}))).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
        client.close().await;
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure_is_process_error() {
        let spec = StdioSpec {
            command: "definitely-not-a-real-binary-mcpgate".to_string(),
            args: vec![],
            envs: HashMap::new(),
        };
        let result = McpClient::connect("test-missing", TransportSpec::Stdio(spec));
        assert!(matches!(result, Err(McpClientError::Process(_))));
    }

    #[tokio::test]
    async fn test_sse_request_before_start_fails() {
        let spec = RemoteSpec {
            url: "http://127.0.0.1:9/sse".to_string(),
            headers: HashMap::new(),
        };
        let client = McpClient::connect("test-sse", TransportSpec::Sse(spec)).unwrap();
        let result = client.ping().await;
        assert!(matches!(result, Err(McpClientError::NotStarted)));
    }
}
