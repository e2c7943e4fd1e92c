//! Per-service env-var definitions (`config_services`) and per-user override
//! values (`user_configs`).

use std::collections::HashMap;

use mcpgate_shared::{is_secret_env_name, ConfigService, ConfigType, GatewayError, UserConfig};
use sqlx::SqlitePool;

pub async fn get_config_options_for_service(
    pool: &SqlitePool,
    service_id: i64,
) -> Result<Vec<ConfigService>, GatewayError> {
    Ok(sqlx::query_as::<_, ConfigService>(
        "SELECT * FROM config_services WHERE service_id = ? ORDER BY order_num ASC, id ASC",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?)
}

pub async fn get_config_option_by_key(
    pool: &SqlitePool,
    service_id: i64,
    key: &str,
) -> Result<Option<ConfigService>, GatewayError> {
    Ok(sqlx::query_as::<_, ConfigService>(
        "SELECT * FROM config_services WHERE service_id = ? AND key = ?",
    )
    .bind(service_id)
    .bind(key)
    .fetch_optional(pool)
    .await?)
}

/// Fetch or create the definition for one env var of a service. Names that
/// look like credentials get the secret type.
pub async fn ensure_config_option(
    pool: &SqlitePool,
    service_id: i64,
    key: &str,
    service_display_name: &str,
) -> Result<ConfigService, GatewayError> {
    if let Some(existing) = get_config_option_by_key(pool, service_id, key).await? {
        return Ok(existing);
    }

    let config_type = if is_secret_env_name(key) {
        ConfigType::Secret
    } else {
        ConfigType::String
    };

    let id = sqlx::query(
        "INSERT INTO config_services (service_id, key, display_name, description, type, required, order_num) \
         VALUES (?, ?, ?, ?, ?, 1, 0)",
    )
    .bind(service_id)
    .bind(key)
    .bind(key)
    .bind(format!(
        "Environment variable {} for {}",
        key, service_display_name
    ))
    .bind(config_type)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(sqlx::query_as::<_, ConfigService>("SELECT * FROM config_services WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?)
}

pub async fn get_user_configs_for_service(
    pool: &SqlitePool,
    user_id: i64,
    service_id: i64,
) -> Result<Vec<UserConfig>, GatewayError> {
    Ok(sqlx::query_as::<_, UserConfig>(
        "SELECT * FROM user_configs WHERE user_id = ? AND service_id = ?",
    )
    .bind(user_id)
    .bind(service_id)
    .fetch_all(pool)
    .await?)
}

/// Upsert one per-user value.
pub async fn save_user_config(
    pool: &SqlitePool,
    user_id: i64,
    service_id: i64,
    config_id: i64,
    value: &str,
) -> Result<(), GatewayError> {
    sqlx::query(
        "INSERT INTO user_configs (user_id, service_id, config_id, value) VALUES (?, ?, ?, ?) \
         ON CONFLICT(user_id, config_id) DO UPDATE SET value = excluded.value",
    )
    .bind(user_id)
    .bind(service_id)
    .bind(config_id)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// The user's env-var overrides for a service, keyed by env var name.
/// Orphaned values whose definition has disappeared are skipped.
pub async fn get_user_specific_envs(
    pool: &SqlitePool,
    user_id: i64,
    service_id: i64,
) -> Result<HashMap<String, String>, GatewayError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT cs.key, uc.value FROM user_configs uc \
         JOIN config_services cs ON cs.id = uc.config_id \
         WHERE uc.user_id = ? AND uc.service_id = ? AND cs.key != ''",
    )
    .bind(user_id)
    .bind(service_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Service defaults merged with the user's overrides, user values winning.
pub async fn effective_envs_for_user(
    pool: &SqlitePool,
    service: &mcpgate_shared::McpService,
    user_id: i64,
) -> Result<HashMap<String, String>, GatewayError> {
    let mut merged = service.default_envs();
    if user_id > 0 {
        for (key, value) in get_user_specific_envs(pool, user_id, service.id).await? {
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, NewService};
    use mcpgate_shared::db::{create_memory_pool, run_migrations};

    async fn test_pool() -> SqlitePool {
        let pool = create_memory_pool().await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn test_ensure_config_option_creates_once() {
        let pool = test_pool().await;
        let first = ensure_config_option(&pool, 1, "API_KEY", "svc").await.unwrap();
        assert_eq!(first.config_type, ConfigType::Secret);

        let second = ensure_config_option(&pool, 1, "API_KEY", "svc").await.unwrap();
        assert_eq!(first.id, second.id);

        let plain = ensure_config_option(&pool, 1, "REGION", "svc").await.unwrap();
        assert_eq!(plain.config_type, ConfigType::String);
    }

    #[tokio::test]
    async fn test_user_config_upsert_and_merge() {
        let pool = test_pool().await;
        let service = registry::create(
            &pool,
            &NewService {
                name: "svc".to_string(),
                display_name: "svc".to_string(),
                command: "npx".to_string(),
                default_envs_json: r#"{"API_KEY":"default","REGION":"us"}"#.to_string(),
                ..NewService::default()
            },
        )
        .await
        .expect("service");

        let option = ensure_config_option(&pool, service.id, "API_KEY", "svc")
            .await
            .unwrap();
        save_user_config(&pool, 7, service.id, option.id, "user-value")
            .await
            .unwrap();
        // Second save overwrites instead of duplicating.
        save_user_config(&pool, 7, service.id, option.id, "user-value-2")
            .await
            .unwrap();

        let envs = get_user_specific_envs(&pool, 7, service.id).await.unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs.get("API_KEY").unwrap(), "user-value-2");

        let merged = effective_envs_for_user(&pool, &service, 7).await.unwrap();
        assert_eq!(merged.get("API_KEY").unwrap(), "user-value-2");
        assert_eq!(merged.get("REGION").unwrap(), "us");

        // Another user sees the defaults untouched.
        let other = effective_envs_for_user(&pool, &service, 8).await.unwrap();
        assert_eq!(other.get("API_KEY").unwrap(), "default");
    }
}
