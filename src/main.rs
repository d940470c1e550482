use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use mailqueue::config::Config;
use mailqueue::database::establish_connection;
use mailqueue::worker::WorkerPool;
use mailqueue::{api, auth, metrics, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting MailQueue on port {}", config.port);

    let db = Arc::new(establish_connection(&config.database_url).await?);
    let state = AppState::build(db, config)?;
    let config = state.config.clone();

    // Worker pool
    let worker_pool = Arc::new(WorkerPool::new(
        state.worker_services(),
        config.worker.clone(),
    ));
    worker_pool.start().await?;

    // Startup reconciliation: rescue emails stranded between the database
    // commit and the broker enqueue, and jobs from crashed workers.
    match state.broker.reclaim_expired(config.worker.visibility_timeout_seconds).await {
        Ok(count) if count > 0 => tracing::info!("Reclaimed {} expired job leases", count),
        Ok(_) => {}
        Err(e) => tracing::error!("Startup lease reclaim failed: {}", e),
    }
    match state
        .submission
        .reconcile(config.worker.visibility_timeout_seconds)
        .await
    {
        Ok(count) if count > 0 => tracing::info!("Reconciled {} stranded emails", count),
        Ok(_) => tracing::info!("No stranded emails to reconcile"),
        Err(e) => tracing::error!("Startup reconciliation failed: {}", e),
    }

    // Periodic maintenance: lease reclaim + email reconciliation + webhook
    // sweeper + rate counter cleanup.
    {
        let state = state.clone();
        let interval_seconds = config.reconcile_interval_seconds;
        let visibility = config.worker.visibility_timeout_seconds;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
            tracing::info!("Reconciliation task started");
            loop {
                interval.tick().await;
                if let Err(e) = state.broker.reclaim_expired(visibility).await {
                    tracing::error!("Lease reclaim failed: {}", e);
                }
                if let Err(e) = state.submission.reconcile(visibility).await {
                    tracing::error!("Email reconciliation failed: {}", e);
                }
                if let Err(e) = state.webhook.sweep_due(200).await {
                    tracing::error!("Webhook sweep failed: {}", e);
                }
                // Keep two days of counters for the daily tier.
                if let Err(e) = state.rate_limiter.cleanup_expired(2 * 86400).await {
                    tracing::error!("Rate counter cleanup failed: {}", e);
                }
            }
        });
    }

    // Reputation engine
    {
        let state = state.clone();
        let interval_seconds = config.reputation_interval_seconds;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
            tracing::info!("Reputation engine started");
            loop {
                interval.tick().await;
                match state.reputation.recompute_recent().await {
                    Ok(count) if count > 0 => {
                        tracing::debug!("Recomputed reputation for {} apps", count);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Reputation recompute failed: {}", e),
                }
            }
        });
    }

    // Cron scheduler
    {
        let scheduler = mailqueue::schedule::SchedulerService::new(
            state.db.clone(),
            state.submission.clone(),
        );
        let interval_seconds = config.scheduler_interval_seconds;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
            tracing::info!("Cron scheduler started");
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.tick().await {
                    tracing::error!("Scheduler tick failed: {}", e);
                }
            }
        });
    }

    // Metrics server on its own port
    let metrics_router = metrics::routes(state.metrics.clone());
    let metrics_port = config.metrics_port;
    let metrics_server = tokio::spawn(async move {
        let listener = match TcpListener::bind(&format!("0.0.0.0:{metrics_port}")).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind metrics port {}: {}", metrics_port, e);
                return;
            }
        };
        tracing::info!("Metrics server listening on http://0.0.0.0:{metrics_port}");
        if let Err(e) = axum::serve(listener, metrics_router).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // API server
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = api::create_router()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(cors)
        .with_state(state.clone());

    let listener = TcpListener::bind(&format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("MailQueue API listening on http://0.0.0.0:{}", config.port);

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Drain active jobs, close SMTP transports, stop the metrics server.
    worker_pool.shutdown().await?;
    metrics_server.abort();

    tracing::info!("MailQueue shutdown complete");
    Ok(())
}
