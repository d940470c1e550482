use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, EntityTrait, PaginatorTrait, QueryOrder, QuerySelect,
    Set,
};
use serde::{Deserialize, Serialize};

use crate::api::response::{ok, paginated, PageQuery};
use crate::auth::{AuthContext, Scope};
use crate::database::apps;
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/apps", post(create_app).get(list_apps))
        .route(
            "/apps/:app_id",
            get(get_app).put(update_app).delete(delete_app),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAppInput {
    name: String,
    sandbox: Option<bool>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    daily_limit: Option<i64>,
    monthly_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAppInput {
    name: Option<String>,
    active: Option<bool>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    daily_limit: Option<i64>,
    monthly_limit: Option<i64>,
}

/// Tenant view; the webhook secret never leaves the store.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppView {
    id: String,
    name: String,
    sandbox: bool,
    active: bool,
    webhook_url: Option<String>,
    daily_limit: Option<i64>,
    monthly_limit: Option<i64>,
    created_at: String,
    updated_at: String,
}

fn micros_to_rfc3339(micros: i64) -> String {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn app_view(model: apps::Model) -> AppView {
    AppView {
        id: model.id,
        name: model.name,
        sandbox: model.sandbox,
        active: model.active,
        webhook_url: model.webhook_url,
        daily_limit: model.daily_limit,
        monthly_limit: model.monthly_limit,
        created_at: micros_to_rfc3339(model.created_at),
        updated_at: micros_to_rfc3339(model.updated_at),
    }
}

fn check_app_access(context: &AuthContext, app_id: &str) -> Result<(), ApiError> {
    if context.is_admin() || context.app_id == app_id {
        Ok(())
    } else {
        Err(ApiError::forbidden("App belongs to another tenant"))
    }
}

async fn create_app(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<CreateAppInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;

    if input.name.trim().is_empty() {
        return Err(ApiError::validation("App name must not be empty"));
    }

    let model = apps::ActiveModel {
        name: Set(input.name.trim().to_string()),
        sandbox: Set(input.sandbox.unwrap_or(false)),
        webhook_url: Set(input.webhook_url),
        webhook_secret: Set(input.webhook_secret),
        daily_limit: Set(input.daily_limit),
        monthly_limit: Set(input.monthly_limit),
        ..apps::ActiveModel::new()
    };
    let app = model.insert(&*state.db).await?;

    tracing::info!(app_id = %app.id, "App created");
    Ok((StatusCode::CREATED, Json(ok(app_view(app)))))
}

async fn list_apps(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;

    let total = apps::Entity::find().count(&*state.db).await?;
    let rows = apps::Entity::find()
        .order_by_desc(apps::Column::CreatedAt)
        .order_by_desc(apps::Column::Id)
        .limit(page.limit())
        .offset(page.offset())
        .all(&*state.db)
        .await?;
    let views: Vec<AppView> = rows.into_iter().map(app_view).collect();
    Ok(Json(ok(paginated(views, total, &page))))
}

async fn load_app(state: &AppState, id: &str) -> Result<apps::Model, ApiError> {
    apps::Entity::find_by_id(id.to_string())
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("App not found"))
}

async fn get_app(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_app_access(&context, &id)?;
    let app = load_app(&state, &id).await?;
    Ok(Json(ok(app_view(app))))
}

async fn update_app(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(input): Json<UpdateAppInput>,
) -> Result<impl IntoResponse, ApiError> {
    check_app_access(&context, &id)?;
    let app = load_app(&state, &id).await?;

    let mut active: apps::ActiveModel = app.into();
    if let Some(name) = input.name {
        if name.trim().is_empty() {
            return Err(ApiError::validation("App name must not be empty"));
        }
        active.name = Set(name.trim().to_string());
    }
    if let Some(is_active) = input.active {
        // Only admins may flip the active flag.
        context.require(Scope::Admin)?;
        active.active = Set(is_active);
    }
    if input.webhook_url.is_some() {
        active.webhook_url = Set(input.webhook_url);
    }
    if input.webhook_secret.is_some() {
        active.webhook_secret = Set(input.webhook_secret);
    }
    if input.daily_limit.is_some() {
        active.daily_limit = Set(input.daily_limit);
    }
    if input.monthly_limit.is_some() {
        active.monthly_limit = Set(input.monthly_limit);
    }
    active.updated_at = Set(chrono::Utc::now().timestamp_micros());

    let app = active.update(&*state.db).await?;
    Ok(Json(ok(app_view(app))))
}

async fn delete_app(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::Admin)?;
    let app = load_app(&state, &id).await?;
    apps::Entity::delete_by_id(app.id).exec(&*state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}
