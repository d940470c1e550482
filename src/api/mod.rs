pub mod analytics;
pub mod api_keys;
pub mod apps;
pub mod emails;
pub mod health;
pub mod queues;
pub mod response;
pub mod smtp_configs;
pub mod suppression;
pub mod tracking;

use crate::AppState;
use axum::Router;

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check (no auth required)
        .merge(health::routes())
        // Public tracking endpoints
        .merge(tracking::routes())
        // Authenticated API surface
        .nest(
            "/v1",
            Router::new()
                .merge(emails::routes())
                .merge(queues::routes())
                .merge(apps::routes())
                .merge(api_keys::routes())
                .merge(suppression::routes())
                .merge(smtp_configs::routes())
                .merge(analytics::routes()),
        )
}
