use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Deserialize;

use crate::api::response::{ok, paginated, PageQuery};
use crate::auth::{AuthContext, Scope};
use crate::database::{emails, queues, smtp_configs};
use crate::error::{ApiError, ErrorCode};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queues", post(create_queue).get(list_queues))
        .route(
            "/queues/:id",
            get(get_queue).put(update_queue).delete(delete_queue),
        )
        .route("/queues/:id/pause", post(pause_queue))
        .route("/queues/:id/resume", post(resume_queue))
        .route("/queues/:id/stats", get(queue_stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueueInput {
    name: String,
    priority: Option<i32>,
    rate_limit: Option<i64>,
    max_retries: Option<i32>,
    retry_delays: Option<Vec<i64>>,
    smtp_config_id: Option<String>,
    settings: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQueueInput {
    priority: Option<i32>,
    rate_limit: Option<i64>,
    max_retries: Option<i32>,
    retry_delays: Option<Vec<i64>>,
    smtp_config_id: Option<String>,
    settings: Option<serde_json::Value>,
}

/// A bound SMTP config must belong to the same tenant.
async fn check_smtp_binding(
    state: &AppState,
    app_id: &str,
    smtp_config_id: &str,
) -> Result<(), ApiError> {
    let owned = smtp_configs::Entity::find_by_id(smtp_config_id.to_string())
        .filter(smtp_configs::Column::AppId.eq(app_id))
        .one(&*state.db)
        .await?
        .is_some();
    if owned {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::InvalidSmtpConfig,
            "SMTP config does not exist or belongs to another app",
        ))
    }
}

async fn create_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<CreateQueueInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;

    if input.name.trim().is_empty() {
        return Err(ApiError::validation("Queue name must not be empty"));
    }
    let priority = input.priority.unwrap_or(5);
    if !(1..=10).contains(&priority) {
        return Err(ApiError::validation("Priority must be between 1 and 10"));
    }
    if let Some(config_id) = input.smtp_config_id.as_deref() {
        check_smtp_binding(&state, &context.app_id, config_id).await?;
    }

    let mut model = queues::ActiveModel {
        app_id: Set(context.app_id.clone()),
        name: Set(input.name.trim().to_string()),
        priority: Set(priority),
        rate_limit: Set(input.rate_limit),
        smtp_config_id: Set(input.smtp_config_id),
        ..queues::ActiveModel::new()
    };
    if let Some(max_retries) = input.max_retries {
        model.max_retries = Set(max_retries);
    }
    if let Some(delays) = input.retry_delays {
        model.retry_delays = Set(serde_json::to_string(&delays)?);
    }
    if let Some(settings) = input.settings {
        model.settings = Set(settings.to_string());
    }

    match model.insert(&*state.db).await {
        Ok(queue) => Ok((StatusCode::CREATED, Json(ok(queue)))),
        Err(e) if e.to_string().to_lowercase().contains("unique") => Err(ApiError::new(
            ErrorCode::DuplicateQueue,
            "A queue with this name already exists",
        )),
        Err(e) => Err(e.into()),
    }
}

async fn list_queues(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;

    let query = queues::Entity::find().filter(queues::Column::AppId.eq(&context.app_id));
    let total = query.clone().count(&*state.db).await?;
    let rows = query
        .order_by_desc(queues::Column::CreatedAt)
        .order_by_desc(queues::Column::Id)
        .limit(page.limit())
        .offset(page.offset())
        .all(&*state.db)
        .await?;
    Ok(Json(ok(paginated(rows, total, &page))))
}

async fn load_queue(
    state: &AppState,
    context: &AuthContext,
    id: &str,
) -> Result<queues::Model, ApiError> {
    queues::Entity::find_by_id(id.to_string())
        .filter(queues::Column::AppId.eq(&context.app_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Queue not found"))
}

async fn get_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = load_queue(&state, &context, &id).await?;
    Ok(Json(ok(queue)))
}

async fn update_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(input): Json<UpdateQueueInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = load_queue(&state, &context, &id).await?;

    if let Some(priority) = input.priority {
        if !(1..=10).contains(&priority) {
            return Err(ApiError::validation("Priority must be between 1 and 10"));
        }
    }
    if let Some(config_id) = input.smtp_config_id.as_deref() {
        check_smtp_binding(&state, &context.app_id, config_id).await?;
    }

    let mut active: queues::ActiveModel = queue.into();
    if let Some(priority) = input.priority {
        active.priority = Set(priority);
    }
    if input.rate_limit.is_some() {
        active.rate_limit = Set(input.rate_limit);
    }
    if let Some(max_retries) = input.max_retries {
        active.max_retries = Set(max_retries);
    }
    if let Some(delays) = input.retry_delays {
        active.retry_delays = Set(serde_json::to_string(&delays)?);
    }
    if input.smtp_config_id.is_some() {
        active.smtp_config_id = Set(input.smtp_config_id);
    }
    if let Some(settings) = input.settings {
        active.settings = Set(settings.to_string());
    }
    active.updated_at = Set(chrono::Utc::now().timestamp_micros());

    let queue = active.update(&*state.db).await?;
    Ok(Json(ok(queue)))
}

async fn delete_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = load_queue(&state, &context, &id).await?;
    queues::Entity::delete_by_id(queue.id)
        .exec(&*state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_paused(
    state: &AppState,
    context: &AuthContext,
    id: &str,
    paused: bool,
) -> Result<queues::Model, ApiError> {
    let queue = load_queue(state, context, id).await?;
    queues::Entity::update_many()
        .col_expr(queues::Column::Paused, Expr::value(paused))
        .col_expr(
            queues::Column::UpdatedAt,
            Expr::value(chrono::Utc::now().timestamp_micros()),
        )
        .filter(queues::Column::Id.eq(&queue.id))
        .exec(&*state.db)
        .await?;
    load_queue(state, context, id).await
}

async fn pause_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = set_paused(&state, &context, &id, true).await?;
    Ok(Json(ok(queue)))
}

async fn resume_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = set_paused(&state, &context, &id, false).await?;
    Ok(Json(ok(queue)))
}

async fn queue_stats(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::QueueManage)?;
    let queue = load_queue(&state, &context, &id).await?;

    let mut stats = serde_json::Map::new();
    for status in [
        "queued",
        "processing",
        "sent",
        "delivered",
        "bounced",
        "failed",
        "cancelled",
    ] {
        let count = emails::Entity::find()
            .filter(emails::Column::QueueId.eq(&queue.id))
            .filter(emails::Column::Status.eq(status))
            .count(&*state.db)
            .await?;
        stats.insert(status.to_string(), serde_json::json!(count));
    }

    Ok(Json(ok(serde_json::json!({
        "queueId": queue.id,
        "name": queue.name,
        "paused": queue.paused,
        "counts": stats,
    }))))
}
