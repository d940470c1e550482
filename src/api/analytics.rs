use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};

use crate::api::response::ok;
use crate::auth::{AuthContext, Scope};
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/analytics/overview", get(overview))
        .route("/analytics/delivery", get(delivery))
        .route("/analytics/engagement", get(engagement))
        .route("/analytics/bounces", get(bounces))
        .route("/analytics/reputation", get(reputation))
}

async fn overview(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::AnalyticsRead)?;
    let stats = state.analytics.overview(&context.app_id).await?;
    Ok(Json(ok(stats)))
}

async fn delivery(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::AnalyticsRead)?;
    let stats = state.analytics.delivery(&context.app_id).await?;
    Ok(Json(ok(stats)))
}

async fn engagement(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::AnalyticsRead)?;
    let stats = state.analytics.engagement(&context.app_id).await?;
    Ok(Json(ok(stats)))
}

async fn bounces(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::AnalyticsRead)?;
    let buckets = state.analytics.bounce_buckets(&context.app_id, 168).await?;
    Ok(Json(ok(buckets)))
}

async fn reputation(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::AnalyticsRead)?;
    let reputation = state.reputation.get(&context.app_id).await?;
    Ok(Json(ok(reputation)))
}
