use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::{Deserialize, Serialize};

use crate::api::response::{ok, paginated, rate_limit_headers, PageQuery};
use crate::auth::{AuthContext, Scope};
use crate::database::{apps, email_events, emails, queues};
use crate::error::{ApiError, ErrorCode};
use crate::ratelimit::{RateLimitOutcome, Tier, TierCheck};
use crate::submission::{receipt, EmailInput};
use crate::AppState;

const MAX_BATCH_SIZE: usize = 1000;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/emails", post(submit_email).get(list_emails))
        .route("/emails/batch", post(submit_batch))
        .route("/emails/:id", get(get_email).delete(cancel_email))
        .route("/emails/:id/events", get(list_events))
        .route("/emails/:id/retry", post(retry_email))
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

async fn acquire_rate(
    state: &AppState,
    context: &AuthContext,
    app: &apps::Model,
    queue: &queues::Model,
) -> Result<RateLimitOutcome, ApiError> {
    let checks = [
        TierCheck {
            tier: Tier::ApiKey,
            id: context.key_id.clone(),
            limit: context.rate_limit,
        },
        TierCheck {
            tier: Tier::AppDaily,
            id: app.id.clone(),
            limit: app.daily_limit,
        },
        TierCheck {
            tier: Tier::Queue,
            id: queue.id.clone(),
            limit: queue.rate_limit,
        },
    ];
    let outcome = state.rate_limiter.acquire(&checks).await?;
    Ok(outcome)
}

fn rate_limit_error(outcome: &RateLimitOutcome) -> ApiError {
    let tier = outcome
        .blocked_by
        .map(|t| t.as_str())
        .unwrap_or("unknown");
    let mut error = ApiError::new(
        ErrorCode::RateLimitExceeded,
        format!("Rate limit exceeded ({tier} tier)"),
    )
    .with_details(serde_json::json!({ "blockedBy": tier }));
    if let Some(retry_after) = outcome.retry_after_seconds() {
        error = error.with_retry_after(retry_after);
    }
    error
}

async fn load_app(state: &AppState, app_id: &str) -> Result<apps::Model, ApiError> {
    apps::Entity::find_by_id(app_id.to_string())
        .one(&*state.db)
        .await?
        .filter(|app| app.active)
        .ok_or_else(|| ApiError::forbidden("App is inactive or missing"))
}

async fn submit_email(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(input): Json<EmailInput>,
) -> Result<axum::response::Response, ApiError> {
    context.require(Scope::EmailSend)?;

    state.submission.validate(&input)?;
    let app = load_app(&state, &context.app_id).await?;
    let queue = state
        .submission
        .resolve_queue(&context.app_id, &input.queue)
        .await?;

    let rate = acquire_rate(&state, &context, &app, &queue).await?;
    let rate_headers = rate_limit_headers(&rate);
    if !rate.allowed {
        let mut response = rate_limit_error(&rate).into_response();
        response.headers_mut().extend(rate_headers);
        return Ok(response);
    }

    let key = idempotency_key(&headers);
    let email = state
        .submission
        .submit(&context.app_id, &queue, input, key)
        .await?;

    let mut response =
        (StatusCode::CREATED, Json(ok(receipt(&email)))).into_response();
    response.headers_mut().extend(rate_headers);
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct BatchInput {
    emails: Vec<EmailInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemResult {
    index: usize,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

async fn submit_batch(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(batch): Json<BatchInput>,
) -> Result<axum::response::Response, ApiError> {
    context.require(Scope::EmailSend)?;

    if batch.emails.is_empty() {
        return Err(ApiError::validation("Batch must contain at least one email"));
    }
    if batch.emails.len() > MAX_BATCH_SIZE {
        return Err(ApiError::validation(format!(
            "Batch size {} exceeds the maximum of {MAX_BATCH_SIZE}",
            batch.emails.len()
        )));
    }

    let app = load_app(&state, &context.app_id).await?;
    let batch_key = idempotency_key(&headers);
    let mut results = Vec::with_capacity(batch.emails.len());
    let mut last_rate = None;

    for (index, input) in batch.emails.into_iter().enumerate() {
        let item = process_batch_item(&state, &context, &app, input, &batch_key, index).await;
        match item {
            Ok((email_id, rate)) => {
                last_rate = Some(rate);
                results.push(BatchItemResult {
                    index,
                    success: true,
                    id: Some(email_id),
                    error: None,
                });
            }
            Err(e) => {
                results.push(BatchItemResult {
                    index,
                    success: false,
                    id: None,
                    error: Some(serde_json::json!({
                        "code": e.code.as_str(),
                        "message": e.message,
                    })),
                });
            }
        }
    }

    let mut response = (StatusCode::CREATED, Json(ok(results))).into_response();
    if let Some(rate) = last_rate {
        response.headers_mut().extend(rate_limit_headers(&rate));
    }
    Ok(response)
}

async fn process_batch_item(
    state: &AppState,
    context: &AuthContext,
    app: &apps::Model,
    input: EmailInput,
    batch_key: &Option<String>,
    index: usize,
) -> Result<(String, RateLimitOutcome), ApiError> {
    state.submission.validate(&input)?;
    let queue = state
        .submission
        .resolve_queue(&context.app_id, &input.queue)
        .await?;

    let rate = acquire_rate(state, context, app, &queue).await?;
    if !rate.allowed {
        return Err(rate_limit_error(&rate));
    }

    // Per-item keys derive from the batch header so replays map 1:1.
    let key = batch_key.as_ref().map(|k| format!("{k}:{index}"));
    let email = state
        .submission
        .submit(&context.app_id, &queue, input, key)
        .await?;
    Ok((email.id, rate))
}

#[derive(Debug, Deserialize)]
struct EmailFilter {
    status: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl EmailFilter {
    fn page(&self) -> PageQuery {
        PageQuery {
            limit: self.limit,
            offset: self.offset,
        }
    }
}

async fn list_emails(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(filter): Query<EmailFilter>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::EmailRead)?;

    let mut query = emails::Entity::find().filter(emails::Column::AppId.eq(&context.app_id));
    if let Some(status) = filter.status.as_deref() {
        query = query.filter(emails::Column::Status.eq(status));
    }

    let page = filter.page();
    let total = query.clone().count(&*state.db).await?;
    let rows = query
        .order_by_desc(emails::Column::CreatedAt)
        .order_by_desc(emails::Column::Id)
        .limit(page.limit())
        .offset(page.offset())
        .all(&*state.db)
        .await?;

    Ok(Json(ok(paginated(rows, total, &page))))
}

async fn get_email(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::EmailRead)?;

    let email = emails::Entity::find_by_id(id)
        .filter(emails::Column::AppId.eq(&context.app_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Email not found"))?;
    Ok(Json(ok(email)))
}

async fn list_events(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::EmailRead)?;

    // Ownership check before exposing the event stream.
    emails::Entity::find_by_id(id.clone())
        .filter(emails::Column::AppId.eq(&context.app_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Email not found"))?;

    let events = email_events::Entity::find()
        .filter(email_events::Column::EmailId.eq(&id))
        .order_by_asc(email_events::Column::CreatedAt)
        .order_by_asc(email_events::Column::Id)
        .all(&*state.db)
        .await?;
    Ok(Json(ok(events)))
}

async fn cancel_email(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::EmailSend)?;
    state.submission.cancel(&context.app_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_email(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::EmailSend)?;
    let email = state.submission.retry(&context.app_id, &id).await?;
    Ok(Json(ok(receipt(&email))))
}
