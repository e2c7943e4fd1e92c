//! Market surface tests: custom services, batch import with its SSE progress
//! stream, env-var patching, and install status fallbacks.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use mcpgate_api::auth::issue_token;
use mcpgate_api::registry::{self, NewService};
use mcpgate_api::routes::build_router;
use mcpgate_api::{AppState, Config};
use mcpgate_shared::db::{create_memory_pool, run_migrations};
use mcpgate_shared::{ServiceType, ROLE_ADMIN, ROLE_COMMON};
use serde_json::{json, Value};
use tower::util::ServiceExt;

const JWT_SECRET: &str = "integration-test-secret-32-chars!!";

async fn build_state() -> AppState {
    let pool = create_memory_pool().await.expect("pool");
    run_migrations(&pool).await.expect("migrations");

    let config = Config {
        port: 3000,
        sqlite_path: ":memory:".to_string(),
        upload_path: "data/upload".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        enable_gzip: true,
        github_token: None,
        log_dir: None,
    };
    AppState::from_pool(config, pool).await.expect("state")
}

async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_custom_service_creation_and_conflict() {
    let state = build_state().await;
    let router = build_router(state.clone());
    let admin = issue_token(JWT_SECRET, 1, ROLE_ADMIN, 1);

    // An unroutable local port keeps registration fast: the service lands in
    // the registry as unhealthy rather than blocking on a live backend.
    let body = json!({
        "name": "My Custom API",
        "type": "streamableHttp",
        "url": "http://127.0.0.1:9/mcp?apiKey=secret"
    });
    let (status, response) = send_json(
        &router,
        "POST",
        "/api/mcp_market/custom_service",
        Some(&admin),
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let service_id = response["data"]["mcp_service_id"].as_i64().expect("id");

    let service = registry::get(&state.pool, service_id).await.expect("row");
    assert_eq!(service.name, "my-custom-api");
    assert_eq!(service.service_type, ServiceType::StreamableHttp);
    assert_eq!(service.url(), "http://127.0.0.1:9/mcp?apiKey=secret");
    // The display description never leaks query credentials.
    assert!(!service.description.contains("secret"));

    // Same (sanitised) name again conflicts.
    let (status, _) = send_json(
        &router,
        "POST",
        "/api/mcp_market/custom_service",
        Some(&admin),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    state.manager.shutdown().await;
}

#[tokio::test]
async fn test_custom_service_requires_admin() {
    let state = build_state().await;
    let router = build_router(state.clone());
    let user = issue_token(JWT_SECRET, 2, ROLE_COMMON, 1);

    let body = json!({"name": "x", "type": "sse", "url": "https://x.example/sse"});
    let (status, _) = send_json(
        &router,
        "POST",
        "/api/mcp_market/custom_service",
        Some(&user),
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_json(&router, "POST", "/api/mcp_market/custom_service", None, Some(body))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_batch_import_with_progress_stream() {
    let state = build_state().await;
    let router = build_router(state.clone());
    let admin = issue_token(JWT_SECRET, 1, ROLE_ADMIN, 1);

    let body = json!({
        "mcpServers": {
            "alpha": {"command": "./alpha-server", "args": ["--stdio"]},
            "bravo": {"url": "https://bravo.example/sse"}
        }
    });
    let (status, response) = send_json(
        &router,
        "POST",
        "/api/mcp_market/batch-import",
        Some(&admin),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = response["task_id"].as_str().expect("task id").to_string();

    // Let the background import run to completion; events stay buffered.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let progress = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!(
                    "/api/mcp_market/batch-import/progress/{}?token={}",
                    task_id, admin
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(progress.status(), StatusCode::OK);
    let content_type = progress
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));

    let raw = axum::body::to_bytes(progress.into_body(), usize::MAX)
        .await
        .expect("stream body");
    let text = String::from_utf8_lossy(&raw);

    let events: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).expect("event json"))
        .collect();
    assert_eq!(events.len(), 3);
    assert!(events[..2]
        .iter()
        .all(|e| e["status"] == "success"));
    let done = &events[2];
    assert_eq!(done["status"], "done");
    assert_eq!(done["summary"]["success"], 2);
    assert_eq!(done["summary"]["failed"], 0);

    // Both rows landed with the right transports.
    let alpha = registry::get_by_name(&state.pool, "alpha").await.expect("alpha");
    assert_eq!(alpha.service_type, ServiceType::Stdio);
    let bravo = registry::get_by_name(&state.pool, "bravo").await.expect("bravo");
    assert_eq!(bravo.service_type, ServiceType::Sse);

    // A second consumer finds nothing.
    let (status, _) = send_json(
        &router,
        "GET",
        &format!("/api/mcp_market/batch-import/progress/{}?token={}", task_id, admin),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_import_progress_requires_admin_token() {
    let state = build_state().await;
    let router = build_router(state.clone());
    let user = issue_token(JWT_SECRET, 2, ROLE_COMMON, 1);

    let (status, _) = send_json(
        &router,
        "GET",
        &format!("/api/mcp_market/batch-import/progress/nope?token={}", user),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_patch_env_var_admin_vs_user() {
    let state = build_state().await;
    let service = registry::create(
        &state.pool,
        &NewService {
            name: "cfg".to_string(),
            display_name: "cfg".to_string(),
            command: "npx".to_string(),
            default_envs_json: r#"{"API_KEY":"original"}"#.to_string(),
            package_manager: "npm".to_string(),
            source_package_name: "cfg".to_string(),
            ..NewService::default()
        },
    )
    .await
    .expect("service");

    let router = build_router(state.clone());
    let admin = issue_token(JWT_SECRET, 1, ROLE_ADMIN, 1);
    let user = issue_token(JWT_SECRET, 7, ROLE_COMMON, 1);

    // Admin writes flow into the service defaults.
    let (status, _) = send_json(
        &router,
        "PATCH",
        "/api/mcp_market/env_var",
        Some(&admin),
        Some(json!({"service_id": service.id, "var_name": "API_KEY", "var_value": "admin-set"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let row = registry::get(&state.pool, service.id).await.unwrap();
    assert_eq!(row.default_envs().get("API_KEY").unwrap(), "admin-set");

    // User writes become a personal override, defaults untouched.
    let (status, _) = send_json(
        &router,
        "PATCH",
        "/api/mcp_market/env_var",
        Some(&user),
        Some(json!({"service_id": service.id, "var_name": "API_KEY", "var_value": "mine"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let row = registry::get(&state.pool, service.id).await.unwrap();
    assert_eq!(row.default_envs().get("API_KEY").unwrap(), "admin-set");
    let envs = mcpgate_api::user_config::get_user_specific_envs(&state.pool, 7, service.id)
        .await
        .unwrap();
    assert_eq!(envs.get("API_KEY").unwrap(), "mine");
}

#[tokio::test]
async fn test_install_status_falls_back_to_row_state() {
    let state = build_state().await;
    let installed = registry::create(
        &state.pool,
        &NewService {
            name: "done".to_string(),
            display_name: "done".to_string(),
            command: "npx".to_string(),
            installed_version: "2.0.0".to_string(),
            package_manager: "npm".to_string(),
            source_package_name: "done".to_string(),
            ..NewService::default()
        },
    )
    .await
    .expect("service");

    let router = build_router(state.clone());
    let user = issue_token(JWT_SECRET, 7, ROLE_COMMON, 1);

    let (status, body) = send_json(
        &router,
        "GET",
        &format!("/api/mcp_market/install_status/{}", installed.id),
        Some(&user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");

    let (status, _) = send_json(
        &router,
        "GET",
        "/api/mcp_market/install_status/9999",
        Some(&user),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_installed_listing_includes_envs_and_quota() {
    let state = build_state().await;
    registry::create(
        &state.pool,
        &NewService {
            name: "listed".to_string(),
            display_name: "listed".to_string(),
            command: "npx".to_string(),
            default_envs_json: r#"{"API_KEY":"default"}"#.to_string(),
            rpd_limit: 10,
            package_manager: "npm".to_string(),
            source_package_name: "listed".to_string(),
            ..NewService::default()
        },
    )
    .await
    .expect("service");

    let router = build_router(state.clone());
    let user = issue_token(JWT_SECRET, 7, ROLE_COMMON, 1);

    let (status, body) = send_json(&router, "GET", "/api/mcp_market/installed", Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let entry = &body["data"][0];
    assert_eq!(entry["name"], "listed");
    assert_eq!(entry["env_vars"]["API_KEY"], "default");
    assert_eq!(entry["user_daily_request_count"], 0);
    assert_eq!(entry["remaining_requests"], 10);
    assert_eq!(entry["health_status"], "unknown");
}

#[tokio::test]
async fn test_options_update_clears_sse_handlers() {
    let state = build_state().await;
    let router = build_router(state.clone());
    let admin = issue_token(JWT_SECRET, 1, ROLE_ADMIN, 1);

    let (status, _) = send_json(
        &router,
        "PUT",
        "/api/option/",
        Some(&admin),
        Some(json!({"key": "ServerAddress", "value": "https://public.example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.proxy_base_url(), "https://public.example.com/proxy");

    let (status, body) = send_json(&router, "GET", "/api/option/", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let options = body["data"].as_array().expect("options list");
    assert!(options
        .iter()
        .any(|o| o["key"] == "ServerAddress" && o["value"] == "https://public.example.com"));
}
