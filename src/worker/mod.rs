//! Worker pool: a fixed set of claim loops draining the broker lanes.
//!
//! Each worker takes one job to completion before leasing another. The
//! send protocol re-checks rate limits, reputation and suppression at
//! dispatch time, rewrites tracking links, sends through the pooled SMTP
//! transport and hands failures to the retry controller.

pub mod bounce;
pub mod retry;

use crate::analytics::AnalyticsService;
use crate::broker::{Broker, JobPayload, Lane, LeasedJob};
use crate::config::WorkerConfig;
use crate::database::email_events::{self, EventType};
use crate::database::emails::{self, EmailStatus};
use crate::database::{apps, queues, smtp_configs};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::ratelimit::{RateLimiter, Tier, TierCheck};
use crate::reputation::ReputationService;
use crate::smtp::{self, SmtpError, SmtpPool};
use crate::suppression::SuppressionService;
use crate::tracking::TrackingService;
use crate::webhook::WebhookService;
use bounce::BounceProcessor;
use retry::Classification;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{sync::RwLock, task::JoinHandle, time::sleep};

const REPUTATION_DEFER_SECONDS: i64 = 300;
const FAILURE_RETRY_DELAY_SECONDS: i64 = 30;
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const LANES: [Lane; 4] = [Lane::Email, Lane::Webhook, Lane::Tracking, Lane::Analytics];

/// What to do with the broker job after a handler returns.
enum JobOutcome {
    Ack,
    Defer { delay_seconds: i64 },
}

/// Everything a worker needs to run any job type.
pub struct WorkerServices {
    pub db: Arc<DatabaseConnection>,
    pub broker: Broker,
    pub smtp: SmtpPool,
    pub suppression: SuppressionService,
    pub tracking: TrackingService,
    pub webhook: WebhookService,
    pub rate_limiter: RateLimiter,
    pub reputation: ReputationService,
    pub analytics: AnalyticsService,
    pub bounce: BounceProcessor,
    pub metrics: Arc<Metrics>,
}

pub struct WorkerPool {
    services: Arc<WorkerServices>,
    config: WorkerConfig,
    is_running: Arc<AtomicBool>,
    workers: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    pub fn new(services: Arc<WorkerServices>, config: WorkerConfig) -> Self {
        Self {
            services,
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            workers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            tracing::warn!("Worker pool is already running");
            return Ok(());
        }
        self.is_running.store(true, Ordering::SeqCst);
        self.services.metrics.worker_status.set(1);

        tracing::info!(
            worker_count = self.config.worker_count,
            "Starting worker pool"
        );

        let mut workers = self.workers.write().await;
        for i in 0..self.config.worker_count {
            let worker_id = format!("worker-{i}");
            let services = self.services.clone();
            let is_running = self.is_running.clone();
            let poll_interval = Duration::from_millis(self.config.job_poll_interval_ms);

            workers.push(tokio::spawn(async move {
                tracing::debug!(worker_id = %worker_id, "Worker started");
                while is_running.load(Ordering::SeqCst) {
                    match next_job(&services, &worker_id).await {
                        Ok(Some(job)) => {
                            services.metrics.active_jobs.inc();
                            run_job(&services, job).await;
                            services.metrics.active_jobs.dec();
                        }
                        Ok(None) => sleep(poll_interval).await,
                        Err(e) => {
                            tracing::error!(worker_id = %worker_id, "Lease failed: {}", e);
                            sleep(poll_interval).await;
                        }
                    }
                }
                tracing::debug!(worker_id = %worker_id, "Worker stopped");
            }));
        }

        tracing::info!("Worker pool started with {} workers", workers.len());
        Ok(())
    }

    /// Stop leasing, wait for in-flight jobs, release SMTP transports.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down worker pool...");
        self.is_running.store(false, Ordering::SeqCst);

        let mut workers = self.workers.write().await;
        for (index, handle) in workers.drain(..).enumerate() {
            match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Worker {} panicked during shutdown: {}", index, e),
                Err(_) => tracing::error!("Worker {} shutdown timed out", index),
            }
        }

        self.services.smtp.shutdown().await;
        self.services.metrics.worker_status.set(0);
        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Lease and run at most one due job. Returns whether a job ran.
    /// Lets operators and tests drive the pool one step at a time.
    pub async fn process_one(&self, worker_id: &str) -> Result<bool> {
        match next_job(&self.services, worker_id).await? {
            Some(job) => {
                run_job(&self.services, job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn next_job(services: &WorkerServices, worker_id: &str) -> Result<Option<LeasedJob>> {
    for lane in LANES {
        if let Some(job) = services.broker.lease(lane, worker_id).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

async fn run_job(services: &WorkerServices, job: LeasedJob) {
    let job_id = job.id.clone();
    let outcome = dispatch(services, &job).await;

    let result = match outcome {
        Ok(JobOutcome::Ack) => services.broker.ack(&job_id).await,
        Ok(JobOutcome::Defer { delay_seconds }) => {
            services.broker.nack(&job_id, delay_seconds).await
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, "Job handler failed: {}", e);
            services
                .broker
                .nack(&job_id, FAILURE_RETRY_DELAY_SECONDS)
                .await
        }
    };
    if let Err(e) = result {
        tracing::error!(job_id = %job_id, "Failed to resolve broker job: {}", e);
    }
}

async fn dispatch(services: &WorkerServices, job: &LeasedJob) -> Result<JobOutcome> {
    match &job.payload {
        JobPayload::SendEmail { email_id, .. } => handle_send_email(services, email_id).await,
        JobPayload::DeliverWebhook { delivery_id } => {
            services.webhook.deliver(delivery_id).await?;
            Ok(JobOutcome::Ack)
        }
        JobPayload::RecordTracking {
            email_id,
            event_type,
            data,
        } => handle_record_tracking(services, email_id, event_type, data).await,
        JobPayload::AggregateStats {
            app_id,
            event_type,
            occurred_at,
        } => {
            services.analytics.bump(app_id, event_type, *occurred_at).await?;
            Ok(JobOutcome::Ack)
        }
        JobPayload::UpdateReputation { app_id } => {
            services.reputation.recompute_app(app_id).await?;
            Ok(JobOutcome::Ack)
        }
        JobPayload::ProcessBounce { app_id, .. } => {
            services.bounce.process_bounce(&job.payload).await?;
            enqueue_stat(services, app_id, "bounced").await;
            Ok(JobOutcome::Ack)
        }
        JobPayload::ProcessComplaint { app_id, .. } => {
            services.bounce.process_complaint(&job.payload).await?;
            enqueue_stat(services, app_id, "complained").await;
            Ok(JobOutcome::Ack)
        }
    }
}

async fn enqueue_stat(services: &WorkerServices, app_id: &str, event_type: &str) {
    let payload = JobPayload::AggregateStats {
        app_id: app_id.to_string(),
        event_type: event_type.to_string(),
        occurred_at: chrono::Utc::now().timestamp_micros(),
    };
    if let Err(e) = services.broker.enqueue(Lane::Analytics, 1, 0, &payload).await {
        tracing::warn!(app_id, event_type, "Failed to enqueue stats job: {}", e);
    }
}

async fn handle_record_tracking(
    services: &WorkerServices,
    email_id: &str,
    event_type: &str,
    data: &serde_json::Value,
) -> Result<JobOutcome> {
    let Some(email) = emails::Entity::find_by_id(email_id.to_string())
        .one(&*services.db)
        .await?
    else {
        tracing::debug!(email_id, "Tracking event for unknown email, dropping");
        return Ok(JobOutcome::Ack);
    };

    let event = match event_type {
        "opened" => EventType::Opened,
        "clicked" => EventType::Clicked,
        other => {
            tracing::warn!(event_type = other, "Unknown tracking event type");
            return Ok(JobOutcome::Ack);
        }
    };

    email_events::append(&*services.db, email_id, event, data.clone()).await?;

    if event == EventType::Clicked {
        if let Some(code) = data.get("shortCode").and_then(|c| c.as_str()) {
            services.tracking.increment_click(code).await?;
        }
    }

    enqueue_stat(services, &email.app_id, event_type).await;
    Ok(JobOutcome::Ack)
}

/// The send protocol. See the state machine: queued -> processing ->
/// sent | failed | queued (transient retry).
async fn handle_send_email(services: &WorkerServices, email_id: &str) -> Result<JobOutcome> {
    let started = Instant::now();

    // 1. Fetch & guard.
    let Some(email) = emails::Entity::find_by_id(email_id.to_string())
        .one(&*services.db)
        .await?
    else {
        tracing::warn!(email_id, "Send job for missing email, dropping");
        return Ok(JobOutcome::Ack);
    };

    let status = EmailStatus::from(email.status.clone());
    if !matches!(status, EmailStatus::Queued | EmailStatus::Processing) {
        tracing::debug!(email_id, status = %email.status, "Email already handled, dropping job");
        return Ok(JobOutcome::Ack);
    }

    let Some(app) = apps::Entity::find_by_id(email.app_id.clone())
        .one(&*services.db)
        .await?
    else {
        tracing::warn!(email_id, "App gone, dropping send job");
        return Ok(JobOutcome::Ack);
    };

    let Some(queue) = queues::Entity::find_by_id(email.queue_id.clone())
        .one(&*services.db)
        .await?
    else {
        fail_terminal(services, &email, &app, None, "queue_missing").await?;
        return Ok(JobOutcome::Ack);
    };

    // 2. Rate limit re-check (no increment at dispatch). Deferrals happen
    //    before the processing transition so deferred jobs do not stack up
    //    processing events.
    let checks = [
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
    let rate = services.rate_limiter.check(&checks).await?;
    if !rate.allowed {
        let delay = rate.retry_after_seconds().unwrap_or(60) as i64;
        tracing::debug!(email_id, delay, "Rate limited at dispatch, deferring");
        return Ok(JobOutcome::Defer {
            delay_seconds: delay,
        });
    }

    // 3. Reputation gate.
    if services.reputation.is_throttled(&app.id).await? {
        tracing::debug!(email_id, "App throttled, deferring send");
        return Ok(JobOutcome::Defer {
            delay_seconds: REPUTATION_DEFER_SECONDS,
        });
    }

    // Transition to processing.
    let now = chrono::Utc::now().timestamp_micros();
    let claimed = emails::Entity::update_many()
        .col_expr(emails::Column::Status, Expr::value("processing"))
        .col_expr(emails::Column::UpdatedAt, Expr::value(now))
        .filter(emails::Column::Id.eq(&email.id))
        .filter(emails::Column::Status.is_in(["queued", "processing"]))
        .exec(&*services.db)
        .await?;
    if claimed.rows_affected == 0 {
        // A peer progressed the state; it owns the email now.
        return Ok(JobOutcome::Ack);
    }
    email_events::append(&*services.db, &email.id, EventType::Processing, serde_json::json!({}))
        .await?;

    // 4. Suppression re-check; a recipient may have been suppressed since
    //    submission.
    let recipients = email.all_recipient_addresses();
    if let Some((address, _reason)) = services
        .suppression
        .first_suppressed(&app.id, &recipients)
        .await?
    {
        services
            .suppression
            .update_source(&app.id, &address, &email.id)
            .await?;
        suppressed_terminal(services, &email, &app, &queue, &address).await?;
        record_processed(services, &email, &queue, "failed", started);
        return Ok(JobOutcome::Ack);
    }

    // 5. Body preparation.
    let html_body = match (&email.html_body, queue.tracking_enabled()) {
        (Some(html), true) => Some(services.tracking.prepare_html(&email.id, html).await?),
        (Some(html), false) => Some(html.clone()),
        (None, _) => None,
    };

    // 6. SMTP config: the queue's binding, else the app's active config.
    let smtp_config = match resolve_smtp_config(services, &queue, &app).await? {
        Some(config) => config,
        None => {
            fail_terminal(services, &email, &app, Some(&queue), "no_smtp_config").await?;
            record_processed(services, &email, &queue, "failed", started);
            return Ok(JobOutcome::Ack);
        }
    };

    // 7. Send.
    let message = match smtp::build_message(&email, html_body.as_deref()) {
        Ok(message) => message,
        Err(e) => {
            let outcome =
                handle_send_failure(services, &email, &app, &queue, &smtp_config, e).await?;
            record_failure_metrics(services, &email, &queue, &outcome, started);
            return Ok(outcome.into_job_outcome());
        }
    };

    let active_gauge = services
        .metrics
        .smtp_connections_active
        .with_label_values(&[&smtp_config.host]);
    active_gauge.inc();
    let send_result = services.smtp.send(&smtp_config, &message).await;
    active_gauge.dec();

    match send_result {
        Ok(outcome) => {
            services
                .metrics
                .smtp_send_duration_seconds
                .with_label_values(&[&smtp_config.host, "success"])
                .observe(outcome.duration.as_secs_f64());

            mark_sent(services, &email, &app, &queue, &outcome.response).await?;
            record_processed(services, &email, &queue, "sent", started);
            Ok(JobOutcome::Ack)
        }
        Err(e) => {
            services
                .metrics
                .smtp_send_duration_seconds
                .with_label_values(&[&smtp_config.host, "error"])
                .observe(started.elapsed().as_secs_f64());
            services
                .metrics
                .smtp_errors_total
                .with_label_values(&[&smtp_config.host, error_type(&e)])
                .inc();

            let outcome = handle_send_failure(services, &email, &app, &queue, &smtp_config, e).await?;
            record_failure_metrics(services, &email, &queue, &outcome, started);
            Ok(outcome.into_job_outcome())
        }
    }
}

enum FailureOutcome {
    Terminal,
    Retry { delay_seconds: i64 },
}

impl FailureOutcome {
    fn into_job_outcome(self) -> JobOutcome {
        match self {
            FailureOutcome::Terminal => JobOutcome::Ack,
            FailureOutcome::Retry { delay_seconds } => JobOutcome::Defer { delay_seconds },
        }
    }
}

fn error_type(error: &SmtpError) -> &'static str {
    match error {
        SmtpError::Config { .. } => "config",
        SmtpError::Connection { .. } => "connection",
        SmtpError::Send { .. } => "send",
        SmtpError::Timeout { .. } => "timeout",
        SmtpError::Build { .. } => "build",
    }
}

async fn resolve_smtp_config(
    services: &WorkerServices,
    queue: &queues::Model,
    app: &apps::Model,
) -> Result<Option<smtp_configs::Model>> {
    if let Some(config_id) = queue.smtp_config_id.as_deref() {
        let config = smtp_configs::Entity::find_by_id(config_id.to_string())
            .filter(smtp_configs::Column::Active.eq(true))
            .one(&*services.db)
            .await?;
        if config.is_some() {
            return Ok(config);
        }
    }
    Ok(smtp_configs::Entity::find()
        .filter(smtp_configs::Column::AppId.eq(&app.id))
        .filter(smtp_configs::Column::Active.eq(true))
        .one(&*services.db)
        .await?)
}

async fn mark_sent(
    services: &WorkerServices,
    email: &emails::Model,
    app: &apps::Model,
    queue: &queues::Model,
    response: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp_micros();
    let message_id = extract_message_id(response);

    let updated = emails::Entity::update_many()
        .col_expr(emails::Column::Status, Expr::value("sent"))
        .col_expr(emails::Column::SentAt, Expr::value(Some(now)))
        .col_expr(emails::Column::MessageId, Expr::value(message_id.clone()))
        .col_expr(emails::Column::UpdatedAt, Expr::value(now))
        .filter(emails::Column::Id.eq(&email.id))
        .filter(emails::Column::Status.eq("processing"))
        .exec(&*services.db)
        .await?;
    if updated.rows_affected == 0 {
        tracing::warn!(email_id = %email.id, "Lost sent transition to a peer");
        return Ok(());
    }

    email_events::append(
        &*services.db,
        &email.id,
        EventType::Sent,
        serde_json::json!({ "response": response, "messageId": message_id }),
    )
    .await?;

    let fresh = emails::Entity::find_by_id(email.id.clone())
        .one(&*services.db)
        .await?
        .unwrap_or_else(|| email.clone());
    services
        .webhook
        .publish(app, Some(&fresh), Some(queue.name.as_str()), "email.sent", None)
        .await?;

    enqueue_stat(services, &app.id, "sent").await;
    tracing::info!(email_id = %email.id, queue = %queue.name, "Email sent");
    Ok(())
}

/// Terminal failure outside the SMTP path (missing config, dead queue).
async fn fail_terminal(
    services: &WorkerServices,
    email: &emails::Model,
    app: &apps::Model,
    queue: Option<&queues::Model>,
    error: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp_micros();
    emails::Entity::update_many()
        .col_expr(emails::Column::Status, Expr::value("failed"))
        .col_expr(emails::Column::LastError, Expr::value(Some(error.to_string())))
        .col_expr(emails::Column::UpdatedAt, Expr::value(now))
        .filter(emails::Column::Id.eq(&email.id))
        .filter(emails::Column::Status.is_in(["queued", "processing"]))
        .exec(&*services.db)
        .await?;

    email_events::append(
        &*services.db,
        &email.id,
        EventType::Failed,
        serde_json::json!({ "error": error }),
    )
    .await?;

    let fresh = emails::Entity::find_by_id(email.id.clone())
        .one(&*services.db)
        .await?
        .unwrap_or_else(|| email.clone());
    services
        .webhook
        .publish(
            app,
            Some(&fresh),
            queue.map(|q| q.name.as_str()),
            "email.failed",
            None,
        )
        .await?;

    tracing::warn!(email_id = %email.id, error, "Email failed terminally");
    Ok(())
}

/// Terminal failure for a recipient suppressed between submission and
/// dispatch.
async fn suppressed_terminal(
    services: &WorkerServices,
    email: &emails::Model,
    app: &apps::Model,
    queue: &queues::Model,
    address: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp_micros();
    let error = format!("recipient_suppressed:{address}");

    emails::Entity::update_many()
        .col_expr(emails::Column::Status, Expr::value("failed"))
        .col_expr(emails::Column::LastError, Expr::value(Some(error.clone())))
        .col_expr(emails::Column::UpdatedAt, Expr::value(now))
        .filter(emails::Column::Id.eq(&email.id))
        .filter(emails::Column::Status.eq("processing"))
        .exec(&*services.db)
        .await?;

    let event_data = serde_json::json!({
        "bounceType": "hard",
        "bounceSubType": "suppressed",
        "address": address,
    });
    email_events::append(&*services.db, &email.id, EventType::Bounced, event_data.clone())
        .await?;

    let fresh = emails::Entity::find_by_id(email.id.clone())
        .one(&*services.db)
        .await?
        .unwrap_or_else(|| email.clone());
    services
        .webhook
        .publish(
            app,
            Some(&fresh),
            Some(queue.name.as_str()),
            "email.bounced",
            Some(event_data),
        )
        .await?;

    tracing::info!(email_id = %email.id, address, "Send blocked by suppression");
    Ok(())
}

/// Retry controller: classify the failure, then either go terminal or
/// schedule the next attempt on the queue's delay curve.
async fn handle_send_failure(
    services: &WorkerServices,
    email: &emails::Model,
    app: &apps::Model,
    queue: &queues::Model,
    smtp_config: &smtp_configs::Model,
    error: SmtpError,
) -> Result<FailureOutcome> {
    let classification = retry::classify_error(&error);
    let message = error.to_string();
    let now = chrono::Utc::now().timestamp_micros();

    let retries_exhausted = email.retry_count + 1 > queue.max_retries;
    let terminal = classification == Classification::Permanent || retries_exhausted;

    if terminal {
        emails::Entity::update_many()
            .col_expr(emails::Column::Status, Expr::value("failed"))
            .col_expr(emails::Column::LastError, Expr::value(Some(message.clone())))
            .col_expr(emails::Column::UpdatedAt, Expr::value(now))
            .filter(emails::Column::Id.eq(&email.id))
            .filter(emails::Column::Status.eq("processing"))
            .exec(&*services.db)
            .await?;

        email_events::append(
            &*services.db,
            &email.id,
            EventType::Failed,
            serde_json::json!({ "error": message, "retries": email.retry_count }),
        )
        .await?;

        let fresh = emails::Entity::find_by_id(email.id.clone())
            .one(&*services.db)
            .await?
            .unwrap_or_else(|| email.clone());
        services
            .webhook
            .publish(app, Some(&fresh), Some(queue.name.as_str()), "email.failed", None)
            .await?;

        // A permanent server reply is an inline DSN: feed the bounce
        // processor so suppression and subscribers learn about it.
        if classification == Classification::Permanent
            && matches!(error, SmtpError::Send { .. })
        {
            let dsn = retry::extract_dsn(&message, &email.all_recipient_addresses());
            let payload = JobPayload::ProcessBounce {
                email_id: email.id.clone(),
                app_id: app.id.clone(),
                bounce_type: dsn.bounce_type,
                bounce_sub_type: Some(dsn.bounce_sub_type),
                bounce_message: Some(dsn.excerpt),
                bounced_recipients: dsn.recipients,
                timestamp: now,
            };
            services.broker.enqueue(Lane::Email, 5, 0, &payload).await?;
        }

        tracing::warn!(
            email_id = %email.id,
            host = %smtp_config.host,
            error = %message,
            "Send failed permanently"
        );
        return Ok(FailureOutcome::Terminal);
    }

    // Transient: back to queued and retry on the queue's delay curve.
    let delays = queue.retry_delays();
    let delay_index = (email.retry_count as usize).min(delays.len().saturating_sub(1));
    let delay_seconds = delays.get(delay_index).copied().unwrap_or(60);

    emails::Entity::update_many()
        .col_expr(emails::Column::Status, Expr::value("queued"))
        .col_expr(emails::Column::RetryCount, Expr::value(email.retry_count + 1))
        .col_expr(emails::Column::LastError, Expr::value(Some(message.clone())))
        .col_expr(emails::Column::UpdatedAt, Expr::value(now))
        .filter(emails::Column::Id.eq(&email.id))
        .filter(emails::Column::Status.eq("processing"))
        .exec(&*services.db)
        .await?;

    email_events::append(
        &*services.db,
        &email.id,
        EventType::Queued,
        serde_json::json!({ "retry": true, "error": message }),
    )
    .await?;

    services
        .metrics
        .email_retries_total
        .with_label_values(&[&app.id, &queue.name])
        .inc();

    tracing::info!(
        email_id = %email.id,
        attempt = email.retry_count + 1,
        max_retries = queue.max_retries,
        delay_seconds,
        "Transient send failure, retry scheduled"
    );
    Ok(FailureOutcome::Retry { delay_seconds })
}

fn record_processed(
    services: &WorkerServices,
    email: &emails::Model,
    queue: &queues::Model,
    status: &str,
    started: Instant,
) {
    services
        .metrics
        .emails_processed_total
        .with_label_values(&[&email.app_id, &queue.name, status])
        .inc();
    services
        .metrics
        .email_processing_duration_seconds
        .with_label_values(&[&email.app_id, &queue.name])
        .observe(started.elapsed().as_secs_f64());
}

fn record_failure_metrics(
    services: &WorkerServices,
    email: &emails::Model,
    queue: &queues::Model,
    outcome: &FailureOutcome,
    started: Instant,
) {
    if matches!(outcome, FailureOutcome::Terminal) {
        record_processed(services, email, queue, "failed", started);
    }
}

/// First token that looks like a relay queue id, e.g. the `ABC123` in
/// `250 2.0.0 OK: queued as ABC123`.
fn extract_message_id(response: &str) -> Option<String> {
    let lower = response.to_lowercase();
    if let Some(pos) = lower.find("queued as ") {
        let rest = &response[pos + "queued as ".len()..];
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
            .collect();
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_extraction() {
        assert_eq!(
            extract_message_id("2.0.0 OK: queued as A1B2C3"),
            Some("A1B2C3".to_string())
        );
        assert_eq!(
            extract_message_id("Ok: queued as 4cb05431-1ab"),
            Some("4cb05431-1ab".to_string())
        );
        assert_eq!(extract_message_id("250 OK"), None);
    }

    #[test]
    fn smtp_error_types_for_metrics() {
        assert_eq!(error_type(&SmtpError::Timeout { timeout_ms: 1 }), "timeout");
        assert_eq!(
            error_type(&SmtpError::Send {
                message: "x".into(),
                permanent: true,
                transient: false
            }),
            "send"
        );
    }
}
