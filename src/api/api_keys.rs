use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Extension, Json, Router,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};

use crate::api::response::ok;
use crate::auth::{self, AuthContext, Scope};
use crate::database::api_keys;
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/apps/:app_id/api-keys",
            post(create_key).get(list_keys),
        )
        .route("/apps/:app_id/api-keys/:id", delete(delete_key))
        .route("/apps/:app_id/api-keys/:id/rotate", post(rotate_key))
        .route("/apps/:app_id/api-keys/:id/revoke", post(revoke_key))
}

fn check_app_access(context: &AuthContext, app_id: &str) -> Result<(), ApiError> {
    if context.is_admin() || context.app_id == app_id {
        Ok(())
    } else {
        Err(ApiError::forbidden("Key belongs to another app"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyInput {
    name: String,
    scopes: Vec<String>,
    rate_limit: Option<i64>,
    ip_allowlist: Option<Vec<String>>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Sanitized key view: never includes the hash, includes the plaintext
/// only when freshly minted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyView {
    id: String,
    app_id: String,
    name: String,
    prefix: String,
    scopes: Vec<String>,
    rate_limit: Option<i64>,
    active: bool,
    expires_at: Option<String>,
    last_used_at: Option<String>,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

fn micros_to_rfc3339(micros: i64) -> String {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn key_view(model: api_keys::Model, plaintext: Option<String>) -> KeyView {
    KeyView {
        id: model.id,
        app_id: model.app_id,
        name: model.name,
        prefix: model.prefix,
        scopes: serde_json::from_str(&model.scopes).unwrap_or_default(),
        rate_limit: model.rate_limit,
        active: model.active,
        expires_at: model.expires_at.map(micros_to_rfc3339),
        last_used_at: model.last_used_at.map(micros_to_rfc3339),
        created_at: micros_to_rfc3339(model.created_at),
        key: plaintext,
    }
}

async fn create_key(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(app_id): Path<String>,
    Json(input): Json<CreateKeyInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    check_app_access(&context, &app_id)?;

    let scopes: Vec<&str> = input.scopes.iter().map(|s| s.as_str()).collect();
    for scope in &scopes {
        if Scope::parse(scope).is_none() {
            return Err(ApiError::validation(format!("Unknown scope: {scope}")));
        }
    }

    let minted = auth::mint_key(false);
    let rate_limit = input.rate_limit.or(state.config.default_key_rate_limit);
    let model = api_keys::ActiveModel {
        app_id: Set(app_id),
        name: Set(input.name),
        prefix: Set(minted.prefix.clone()),
        key_hash: Set(minted.key_hash.clone()),
        scopes: Set(serde_json::to_string(&scopes)?),
        rate_limit: Set(rate_limit),
        ip_allowlist: Set(input
            .ip_allowlist
            .as_ref()
            .and_then(|l| serde_json::to_string(l).ok())),
        expires_at: Set(input.expires_at.map(|dt| dt.timestamp_micros())),
        ..api_keys::ActiveModel::new()
    };
    let created = model.insert(&*state.db).await?;

    tracing::info!(key_id = %created.id, "API key created");
    Ok((
        StatusCode::CREATED,
        Json(ok(key_view(created, Some(minted.plaintext)))),
    ))
}

async fn list_keys(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    check_app_access(&context, &app_id)?;

    let keys = api_keys::Entity::find()
        .filter(api_keys::Column::AppId.eq(&app_id))
        .order_by_desc(api_keys::Column::CreatedAt)
        .all(&*state.db)
        .await?;
    let views: Vec<KeyView> = keys.into_iter().map(|k| key_view(k, None)).collect();
    Ok(Json(ok(views)))
}

async fn load_key(
    state: &AppState,
    app_id: &str,
    id: &str,
) -> Result<api_keys::Model, ApiError> {
    api_keys::Entity::find_by_id(id.to_string())
        .filter(api_keys::Column::AppId.eq(app_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("API key not found"))
}

/// Replace the secret in place; the old plaintext stops working at once.
async fn rotate_key(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((app_id, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    check_app_access(&context, &app_id)?;

    let key = load_key(&state, &app_id, &id).await?;
    let minted = auth::mint_key(false);

    let mut active: api_keys::ActiveModel = key.into();
    active.prefix = Set(minted.prefix.clone());
    active.key_hash = Set(minted.key_hash.clone());
    active.active = Set(true);
    let rotated = active.update(&*state.db).await?;

    tracing::info!(key_id = %rotated.id, "API key rotated");
    Ok(Json(ok(key_view(rotated, Some(minted.plaintext)))))
}

async fn revoke_key(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((app_id, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    check_app_access(&context, &app_id)?;

    let key = load_key(&state, &app_id, &id).await?;
    api_keys::Entity::update_many()
        .col_expr(api_keys::Column::Active, Expr::value(false))
        .filter(api_keys::Column::Id.eq(&key.id))
        .exec(&*state.db)
        .await?;

    tracing::info!(key_id = %key.id, "API key revoked");
    Ok(Json(ok(serde_json::json!({ "id": key.id, "active": false }))))
}

async fn delete_key(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path((app_id, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    check_app_access(&context, &app_id)?;

    let key = load_key(&state, &app_id, &id).await?;
    api_keys::Entity::delete_by_id(key.id)
        .exec(&*state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
