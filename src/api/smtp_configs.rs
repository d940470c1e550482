use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use std::str::FromStr;

use crate::api::response::ok;
use crate::auth::{AuthContext, Scope};
use crate::database::smtp_configs::{self, Encryption};
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/smtp-configs", post(create_config).get(list_configs))
        .route(
            "/smtp-configs/:id",
            get(get_config).delete(delete_config),
        )
        .route("/smtp-configs/:id/test", post(test_config))
        .route("/smtp-configs/:id/activate", post(activate_config))
        .route("/smtp-configs/:id/deactivate", post(deactivate_config))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConfigInput {
    name: String,
    host: String,
    port: i32,
    username: Option<String>,
    password: Option<String>,
    encryption: Option<String>,
    pool_size: Option<i32>,
    timeout_ms: Option<i64>,
}

async fn create_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<CreateConfigInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;

    if input.host.trim().is_empty() {
        return Err(ApiError::validation("SMTP host must not be empty"));
    }
    if !(1..=65535).contains(&input.port) {
        return Err(ApiError::validation("SMTP port must be 1-65535"));
    }
    let encryption = input.encryption.as_deref().unwrap_or("tls");
    Encryption::from_str(encryption).map_err(ApiError::validation)?;

    let mut model = smtp_configs::ActiveModel {
        app_id: Set(context.app_id.clone()),
        name: Set(input.name),
        host: Set(input.host.trim().to_string()),
        port: Set(input.port),
        username: Set(input.username),
        password: Set(input.password),
        encryption: Set(encryption.to_string()),
        ..smtp_configs::ActiveModel::new()
    };
    if let Some(pool_size) = input.pool_size {
        if !(1..=100).contains(&pool_size) {
            return Err(ApiError::validation("Pool size must be 1-100"));
        }
        model.pool_size = Set(pool_size);
    }
    if let Some(timeout_ms) = input.timeout_ms {
        model.timeout_ms = Set(timeout_ms);
    }

    let config = model.insert(&*state.db).await?;
    Ok((StatusCode::CREATED, Json(ok(config))))
}

async fn list_configs(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;

    let configs = smtp_configs::Entity::find()
        .filter(smtp_configs::Column::AppId.eq(&context.app_id))
        .order_by_desc(smtp_configs::Column::CreatedAt)
        .all(&*state.db)
        .await?;
    Ok(Json(ok(configs)))
}

async fn load_config(
    state: &AppState,
    context: &AuthContext,
    id: &str,
) -> Result<smtp_configs::Model, ApiError> {
    smtp_configs::Entity::find_by_id(id.to_string())
        .filter(smtp_configs::Column::AppId.eq(&context.app_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("SMTP config not found"))
}

async fn get_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;
    let config = load_config(&state, &context, &id).await?;
    Ok(Json(ok(config)))
}

/// Connect, EHLO, AUTH if credentials exist, then QUIT; reports latency.
async fn test_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;
    let config = load_config(&state, &context, &id).await?;

    let result = state
        .smtp
        .test(&config)
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?;
    Ok(Json(ok(serde_json::json!({
        "success": result.success,
        "latencyMs": result.latency_ms,
        "error": result.error,
    }))))
}

async fn set_active(
    state: &AppState,
    context: &AuthContext,
    id: &str,
    active: bool,
) -> Result<smtp_configs::Model, ApiError> {
    let config = load_config(state, context, id).await?;
    smtp_configs::Entity::update_many()
        .col_expr(smtp_configs::Column::Active, Expr::value(active))
        .filter(smtp_configs::Column::Id.eq(&config.id))
        .exec(&*state.db)
        .await?;
    load_config(state, context, id).await
}

async fn activate_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;
    let config = set_active(&state, &context, &id, true).await?;
    Ok(Json(ok(config)))
}

async fn deactivate_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;
    let config = set_active(&state, &context, &id, false).await?;
    Ok(Json(ok(config)))
}

async fn delete_config(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SmtpManage)?;
    let config = load_config(&state, &context, &id).await?;
    smtp_configs::Entity::delete_by_id(config.id)
        .exec(&*state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
