//! Options endpoints (admin).

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{require_admin, AuthUser};
use crate::error::ApiResult;
use crate::options::OPT_SERVER_ADDRESS;
use crate::routes::{success, success_message};
use crate::state::AppState;

/// `GET /api/option/` (admin)
pub async fn get_options(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let options: Vec<Value> = state
        .options
        .all()
        .into_iter()
        .map(|(key, value)| json!({"key": key, "value": value}))
        .collect();
    Ok(success(options))
}

#[derive(Debug, Deserialize)]
pub struct UpdateOptionRequest {
    pub key: String,
    pub value: String,
}

/// `PUT /api/option/` (admin). A `ServerAddress` change invalidates the SSE
/// handler cache, whose advertised callback URLs embed it.
pub async fn update_option(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(request): Json<UpdateOptionRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(user.as_ref().map(|Extension(u)| u))?;

    let changed = state.options.set(&request.key, &request.value).await?;
    if changed && request.key == OPT_SERVER_ADDRESS {
        state.handlers.clear_sse();
    }

    Ok(success_message("option updated successfully"))
}
