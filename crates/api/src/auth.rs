//! Token authentication for API and proxy routes.
//!
//! Resolves `Authorization: Bearer <jwt>` or a `?key=` / `?token=` query
//! parameter into a user id and role in the request extensions. Routes decide
//! whether an anonymous request is acceptable; `/proxy` is not.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mcpgate_shared::kv::jwt_blacklist_key;
use mcpgate_shared::{ROLE_ADMIN, ROLE_COMMON};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ApiError;
use crate::state::AppState;

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    #[serde(default)]
    pub role: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: String,
}

/// Authenticated caller attached to request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: i64,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role >= ROLE_ADMIN
    }
}

/// Validate an HS256 access token.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 60;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::InvalidToken)
}

/// Issue an access token; identity flows live outside the core, this exists
/// for tooling and tests.
pub fn issue_token(secret: &str, user_id: i64, role: i64, ttl_hours: i64) -> String {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (OffsetDateTime::now_utc() + time::Duration::hours(ttl_hours)).unix_timestamp(),
        jti: uuid::Uuid::new_v4().to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap_or_default()
}

fn bearer_token(request: &Request) -> Option<String> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if (key == "key" || key == "token") && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Middleware: resolve a token into an `AuthUser` extension. Requests without
/// a valid token continue anonymously; enforcement happens per route.
pub async fn token_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(&request).or_else(|| query_token(&request));

    if let Some(token) = token {
        if state.kv.get(&jwt_blacklist_key(&token)).is_some() {
            tracing::debug!("rejected blacklisted token");
        } else if let Ok(claims) = validate_token(&state.config.jwt_secret, &token) {
            let role = if claims.role > 0 { claims.role } else { ROLE_COMMON };
            request.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                role,
            });
        }
    }

    next.run(request).await
}

/// Require an authenticated caller.
pub fn require_user(user: Option<&AuthUser>) -> Result<&AuthUser, ApiError> {
    user.ok_or(ApiError::Unauthorized)
}

/// Require an authenticated admin.
pub fn require_admin(user: Option<&AuthUser>) -> Result<&AuthUser, ApiError> {
    let user = require_user(user)?;
    if !user.is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(user)
}
