use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;

use crate::api::response::{ok, paginated, PageQuery};
use crate::auth::{AuthContext, Scope};
use crate::database::suppression_list::SuppressionReason;
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/suppression", post(add_entry).get(list_entries))
        .route("/suppression/bulk", post(add_bulk))
        .route("/suppression/export", get(export))
        .route("/suppression/import", post(import))
        .route("/suppression/:email", delete(remove_entry))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddInput {
    email: String,
    reason: Option<String>,
    /// Email the entry originated from; unsubscribes recorded against it.
    source_email_id: Option<String>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn parse_reason(raw: Option<&str>) -> Result<SuppressionReason, ApiError> {
    match raw {
        None => Ok(SuppressionReason::Manual),
        Some(raw) => SuppressionReason::from_str(raw).map_err(ApiError::validation),
    }
}

async fn add_entry(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<AddInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SuppressionManage)?;

    if !input.email.contains('@') {
        return Err(ApiError::validation("Invalid email address"));
    }
    let reason = parse_reason(input.reason.as_deref())?;
    let added = state
        .suppression
        .add(
            Some(context.app_id.as_str()),
            &input.email,
            reason,
            input.source_email_id.as_deref(),
            input.expires_at.map(|dt| dt.timestamp_micros()),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ok(serde_json::json!({ "added": added }))),
    ))
}

#[derive(Debug, Deserialize)]
struct BulkInput {
    entries: Vec<AddInput>,
}

async fn add_bulk(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<BulkInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SuppressionManage)?;

    let mut entries = Vec::with_capacity(input.entries.len());
    for entry in &input.entries {
        let reason = parse_reason(entry.reason.as_deref())?;
        entries.push((
            entry.email.clone(),
            reason,
            entry.expires_at.map(|dt| dt.timestamp_micros()),
        ));
    }

    let result = state
        .suppression
        .add_bulk(Some(context.app_id.as_str()), &entries)
        .await?;
    Ok(Json(ok(serde_json::json!({
        "added": result.added,
        "skipped": result.skipped,
    }))))
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SuppressionManage)?;

    let (entries, total) = state
        .suppression
        .list(Some(context.app_id.as_str()), page.limit(), page.offset())
        .await?;
    Ok(Json(ok(paginated(entries, total, &page))))
}

async fn remove_entry(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SuppressionManage)?;

    let removed = state
        .suppression
        .remove(Some(context.app_id.as_str()), &email)
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Suppression entry not found"))
    }
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<ExportQuery>,
) -> Result<axum::response::Response, ApiError> {
    context.require(Scope::SuppressionManage)?;

    let csv = state.suppression.export_csv(Some(context.app_id.as_str())).await?;

    if query.format.as_deref() == Some("csv") {
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"suppression.csv\"",
                ),
            ],
            csv,
        )
            .into_response())
    } else {
        Ok(Json(ok(serde_json::json!({ "csv": csv }))).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct ImportInput {
    csv: String,
}

async fn import(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(input): Json<ImportInput>,
) -> Result<impl IntoResponse, ApiError> {
    context.require(Scope::SuppressionManage)?;

    let result = state
        .suppression
        .import_csv(Some(context.app_id.as_str()), &input.csv)
        .await?;
    Ok(Json(ok(serde_json::json!({
        "imported": result.imported,
        "skipped": result.skipped,
        "errors": result.errors,
    }))))
}
