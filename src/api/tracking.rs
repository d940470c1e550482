use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::broker::{JobPayload, Lane};
use crate::tracking::{decode_open_token, TRACKING_PIXEL};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/t/:token/open.gif", get(open_pixel))
        .route("/c/:code", get(click_redirect))
}

fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        });
    (user_agent, ip)
}

/// Always answers with the pixel; recording happens off the request path.
async fn open_pixel(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Ok(email_id) = decode_open_token(&token) {
        let (user_agent, ip) = client_meta(&headers);
        let payload = JobPayload::RecordTracking {
            email_id,
            event_type: "opened".to_string(),
            data: serde_json::json!({ "userAgent": user_agent, "ip": ip }),
        };
        if let Err(e) = state.broker.enqueue(Lane::Tracking, 1, 0, &payload).await {
            tracing::warn!("Failed to enqueue open event: {}", e);
        }
    } else {
        tracing::debug!(token = %token, "Unparseable open-tracking token");
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, max-age=0",
            ),
        ],
        TRACKING_PIXEL.to_vec(),
    )
}

async fn click_redirect(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let link = match state.tracking.find_link(&code).await {
        Ok(Some(link)) => link,
        Ok(None) => return (StatusCode::NOT_FOUND, "Unknown link").into_response(),
        Err(e) => {
            tracing::error!("Click lookup failed: {}", e);
            return (StatusCode::NOT_FOUND, "Unknown link").into_response();
        }
    };

    let (user_agent, ip) = client_meta(&headers);
    let payload = JobPayload::RecordTracking {
        email_id: link.email_id.clone(),
        event_type: "clicked".to_string(),
        data: serde_json::json!({
            "url": link.original_url,
            "shortCode": code,
            "userAgent": user_agent,
            "ip": ip,
        }),
    };
    if let Err(e) = state.broker.enqueue(Lane::Tracking, 1, 0, &payload).await {
        tracing::warn!("Failed to enqueue click event: {}", e);
    }

    (
        StatusCode::FOUND,
        [(header::LOCATION, link.original_url.clone())],
    )
        .into_response()
}
