//! Per-transport HTTP handlers built atop shared instances, plus the handler
//! cache and the SSE session registry.
//!
//! Handlers hold configuration only; the dispatcher resolves the shared
//! instance through the instance cache on every invocation, so an evicted
//! instance can never be pinned alive by a cached handler.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use mcpgate_shared::McpService;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::mcp::server::McpProxyServer;
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

use super::instance::SharedInstance;

/// Heartbeat cadence on the streamable HTTP leg; defeats idle-connection
/// killers between requests.
const HTTP_HEARTBEAT: Duration = Duration::from_secs(30);
/// Keep-alive cadence for proxy SSE streams.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

// =============================================================================
// Proxy kind
// =============================================================================

/// Which transport handler serves a proxied action path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    SseProxy,
    HttpProxy,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::SseProxy => "sseproxy",
            ProxyKind::HttpProxy => "httpproxy",
        }
    }

    /// Decide the proxy kind from the action suffix. The bool is false when
    /// the action was unrecognised and the SSE default applied.
    pub fn from_action(action: &str) -> (Self, bool) {
        if action == "/mcp" || action.starts_with("/mcp/") {
            return (ProxyKind::HttpProxy, true);
        }
        let recognised = action == "/sse"
            || action == "/message"
            || action.starts_with("/sse/")
            || action.starts_with("/message/");
        (ProxyKind::SseProxy, recognised)
    }
}

// =============================================================================
// SSE sessions
// =============================================================================

struct SseSession {
    server: Arc<McpProxyServer>,
    tx: mpsc::Sender<JsonRpcResponse>,
}

/// Live SSE sessions across all services. POSTed messages are answered on the
/// stream that announced the session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SseSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        session_id: String,
        server: Arc<McpProxyServer>,
        tx: mpsc::Sender<JsonRpcResponse>,
    ) {
        self.sessions.insert(session_id, SseSession { server, tx });
    }

    fn lookup(&self, session_id: &str) -> Option<(Arc<McpProxyServer>, mpsc::Sender<JsonRpcResponse>)> {
        self.sessions
            .get(session_id)
            .map(|s| (s.server.clone(), s.tx.clone()))
    }

    fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Message stream for one SSE session; deregisters the session on drop.
struct SessionStream {
    rx: mpsc::Receiver<JsonRpcResponse>,
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = JsonRpcResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id);
    }
}

// =============================================================================
// SSE proxy handler
// =============================================================================

/// Serves the SSE long-lived channel plus its POST message sink for one
/// service.
pub struct SseProxyHandler {
    service_name: String,
    /// External callback base, `<ServerAddress>/proxy`.
    base_url: String,
    sessions: Arc<SessionRegistry>,
}

impl SseProxyHandler {
    pub fn new(service_name: &str, base_url: &str, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            service_name: service_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            sessions,
        }
    }

    pub async fn serve(
        &self,
        instance: &Arc<SharedInstance>,
        method: &Method,
        action: &str,
        session_id: Option<String>,
        body: Bytes,
    ) -> Response {
        if *method == Method::GET && (action == "/sse" || action.starts_with("/sse/")) {
            return self.open_stream(instance);
        }
        if *method == Method::POST && (action == "/message" || action.starts_with("/message/")) {
            return self.post_message(instance, session_id, body).await;
        }
        (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("unsupported SSE action: {} {}", method, action),
        )
            .into_response()
    }

    /// Open the long-lived channel: first an endpoint event pointing the
    /// client at the message sink, then responses as they are produced.
    fn open_stream(&self, instance: &Arc<SharedInstance>) -> Response {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(32);
        self.sessions
            .register(session_id.clone(), instance.server.clone(), tx);

        let endpoint = format!(
            "{}/{}/message?sessionId={}",
            self.base_url, self.service_name, session_id
        );
        tracing::debug!(service = %self.service_name, session = %session_id, "SSE session opened");

        let initial = futures::stream::once(async move {
            Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
        });
        let messages = SessionStream {
            rx,
            registry: self.sessions.clone(),
            session_id,
        }
        .map(|response| {
            let data = serde_json::to_string(&response).unwrap_or_default();
            Ok::<Event, Infallible>(Event::default().event("message").data(data))
        });

        Sse::new(initial.chain(messages))
            .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
            .into_response()
    }

    /// Accept one JSON-RPC message. With a known session the response is
    /// delivered on the stream and the POST returns 202; without one the
    /// response is returned inline.
    async fn post_message(
        &self,
        instance: &Arc<SharedInstance>,
        session_id: Option<String>,
        body: Bytes,
    ) -> Response {
        let request: JsonRpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => {
                let error = JsonRpcResponse::error(None, JsonRpcError::parse_error(err.to_string()));
                return (StatusCode::BAD_REQUEST, Json(error)).into_response();
            }
        };

        if let Some(session_id) = session_id {
            if let Some((server, tx)) = self.sessions.lookup(&session_id) {
                if let Some(response) = server.handle(request).await {
                    if tx.send(response).await.is_err() {
                        tracing::debug!(session = %session_id, "SSE session closed before delivery");
                    }
                }
                return (StatusCode::ACCEPTED, "Accepted").into_response();
            }
            tracing::debug!(session = %session_id, "unknown SSE session, answering inline");
        }

        match instance.server.handle(request).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        }
    }
}

// =============================================================================
// Streamable HTTP proxy handler
// =============================================================================

/// Serves the streamable HTTP/MCP endpoint for one service.
pub struct HttpProxyHandler {
    service_name: String,
}

impl HttpProxyHandler {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    pub async fn serve(
        &self,
        instance: &Arc<SharedInstance>,
        method: &Method,
        body: Bytes,
    ) -> Response {
        if *method == Method::POST {
            let request: JsonRpcRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(err) => {
                    let error =
                        JsonRpcResponse::error(None, JsonRpcError::parse_error(err.to_string()));
                    return (StatusCode::BAD_REQUEST, Json(error)).into_response();
                }
            };

            return match instance.server.handle(request).await {
                Some(response) => Json(response).into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            };
        }

        // Server->client stream leg: nothing is pushed proactively, but the
        // heartbeat keeps intermediaries from killing the connection.
        if *method == Method::GET {
            return Sse::new(futures::stream::pending::<Result<Event, Infallible>>())
                .keep_alive(KeepAlive::new().interval(HTTP_HEARTBEAT))
                .into_response();
        }
        if *method == Method::DELETE {
            return StatusCode::OK.into_response();
        }

        (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("unsupported method {} for {}", method, self.service_name),
        )
            .into_response()
    }
}

// =============================================================================
// Handler cache
// =============================================================================

/// Caches the global handlers per `(service, proxy kind)`. Per-user handlers
/// are minted on demand by the dispatcher and never stored here.
#[derive(Default)]
pub struct HandlerCache {
    sse: StdMutex<HashMap<String, Arc<SseProxyHandler>>>,
    http: StdMutex<HashMap<String, Arc<HttpProxyHandler>>>,
}

impl HandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sse_key(service_id: i64) -> String {
        format!("service-{}-sseproxy", service_id)
    }

    fn http_key(service_id: i64) -> String {
        format!("service-{}-httpproxy", service_id)
    }

    pub fn get_or_create_sse(
        &self,
        service: &McpService,
        base_url: &str,
        sessions: &Arc<SessionRegistry>,
    ) -> Arc<SseProxyHandler> {
        let key = Self::sse_key(service.id);
        let mut cache = self.sse.lock().unwrap();
        if let Some(handler) = cache.get(&key) {
            return handler.clone();
        }
        let handler = Arc::new(SseProxyHandler::new(&service.name, base_url, sessions.clone()));
        cache.insert(key, handler.clone());
        handler
    }

    pub fn get_or_create_http(&self, service: &McpService) -> Arc<HttpProxyHandler> {
        let key = Self::http_key(service.id);
        let mut cache = self.http.lock().unwrap();
        if let Some(handler) = cache.get(&key) {
            return handler.clone();
        }
        let handler = Arc::new(HttpProxyHandler::new(&service.name));
        cache.insert(key, handler.clone());
        handler
    }

    /// Drop all SSE handlers; called when `ServerAddress` changes since the
    /// advertised callback URL is baked into them.
    pub fn clear_sse(&self) {
        let mut cache = self.sse.lock().unwrap();
        if !cache.is_empty() {
            tracing::info!(count = cache.len(), "clearing cached SSE proxy handlers");
            cache.clear();
        }
    }

    pub fn invalidate_service(&self, service_id: i64) {
        self.sse.lock().unwrap().remove(&Self::sse_key(service_id));
        self.http.lock().unwrap().remove(&Self::http_key(service_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::instance::tests::scripted_service;
    use crate::proxy::instance::InstanceCache;

    async fn scripted_instance(id: i64, name: &str) -> (Arc<InstanceCache>, Arc<SharedInstance>) {
        let cache = Arc::new(InstanceCache::new());
        let service = scripted_service(id, name);
        let instance = cache
            .get_or_create(
                &service,
                &InstanceCache::global_key(id),
                &InstanceCache::global_label(id),
                "{}",
            )
            .await
            .expect("instance");
        (cache, instance)
    }

    #[test]
    fn test_proxy_kind_from_action() {
        assert_eq!(ProxyKind::from_action("/mcp"), (ProxyKind::HttpProxy, true));
        assert_eq!(ProxyKind::from_action("/mcp/x"), (ProxyKind::HttpProxy, true));
        assert_eq!(ProxyKind::from_action("/sse"), (ProxyKind::SseProxy, true));
        assert_eq!(ProxyKind::from_action("/message"), (ProxyKind::SseProxy, true));
        assert_eq!(ProxyKind::from_action("/message/x"), (ProxyKind::SseProxy, true));
        assert_eq!(ProxyKind::from_action("/other"), (ProxyKind::SseProxy, false));
    }

    #[tokio::test]
    async fn test_message_without_session_answers_inline() {
        let (cache, instance) = scripted_instance(40, "svc40").await;
        let sessions = Arc::new(SessionRegistry::new());
        let handler = SseProxyHandler::new("svc40", "http://localhost:3000/proxy", sessions);

        let body = Bytes::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        let response = handler
            .serve(&instance, &Method::POST, "/message", None, body)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_message_notification_is_accepted() {
        let (cache, instance) = scripted_instance(41, "svc41").await;
        let sessions = Arc::new(SessionRegistry::new());
        let handler = SseProxyHandler::new("svc41", "http://localhost:3000/proxy", sessions);

        let body = Bytes::from(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
        let response = handler
            .serve(&instance, &Method::POST, "/message", None, body)
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_message_with_session_streams_response() {
        let (cache, instance) = scripted_instance(42, "svc42").await;
        let sessions = Arc::new(SessionRegistry::new());
        let handler =
            SseProxyHandler::new("svc42", "http://localhost:3000/proxy", sessions.clone());

        let (tx, mut rx) = mpsc::channel(4);
        sessions.register("sess-1".to_string(), instance.server.clone(), tx);

        let body = Bytes::from(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);
        let response = handler
            .serve(
                &instance,
                &Method::POST,
                "/message",
                Some("sess-1".to_string()),
                body,
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let streamed = rx.recv().await.expect("response on stream");
        assert_eq!(
            streamed.id,
            Some(crate::mcp::types::JsonRpcId::Number(7))
        );

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_sse_get_returns_event_stream() {
        let (cache, instance) = scripted_instance(43, "svc43").await;
        let sessions = Arc::new(SessionRegistry::new());
        let handler =
            SseProxyHandler::new("svc43", "http://localhost:3000/proxy", sessions.clone());

        let response = handler
            .serve(&instance, &Method::GET, "/sse", None, Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(sessions.len(), 1);

        // Dropping the response body deregisters the session.
        drop(response);
        tokio::task::yield_now().await;
        assert!(sessions.is_empty());

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_http_handler_post_and_notification() {
        let (cache, instance) = scripted_instance(44, "svc44").await;
        let handler = HttpProxyHandler::new("svc44");

        let body = Bytes::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        let response = handler.serve(&instance, &Method::POST, body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = Bytes::from(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
        let response = handler.serve(&instance, &Method::POST, body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = handler.serve(&instance, &Method::POST, Bytes::from("{bad")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        cache.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_handler_cache_reuse_and_invalidation() {
        let sessions = Arc::new(SessionRegistry::new());
        let cache = HandlerCache::new();
        let service = scripted_service(45, "svc45");

        let a = cache.get_or_create_sse(&service, "http://localhost/proxy", &sessions);
        let b = cache.get_or_create_sse(&service, "http://localhost/proxy", &sessions);
        assert!(Arc::ptr_eq(&a, &b));

        cache.clear_sse();
        let c = cache.get_or_create_sse(&service, "http://localhost/proxy", &sessions);
        assert!(!Arc::ptr_eq(&a, &c));

        let h1 = cache.get_or_create_http(&service);
        cache.invalidate_service(45);
        let h2 = cache.get_or_create_http(&service);
        assert!(!Arc::ptr_eq(&h1, &h2));
    }
}
