use std::sync::Arc;

pub mod analytics;
pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod reputation;
pub mod schedule;
pub mod smtp;
pub mod submission;
pub mod suppression;
pub mod tracking;
pub mod webhook;
pub mod worker;

pub use database::establish_connection;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub config: Arc<config::Config>,
    pub broker: broker::Broker,
    pub rate_limiter: ratelimit::RateLimiter,
    pub suppression: suppression::SuppressionService,
    pub submission: submission::SubmissionService,
    pub tracking: tracking::TrackingService,
    pub webhook: webhook::WebhookService,
    pub reputation: reputation::ReputationService,
    pub analytics: analytics::AnalyticsService,
    pub smtp: smtp::SmtpPool,
    pub metrics: Arc<metrics::Metrics>,
}

impl AppState {
    pub fn build(
        db: Arc<sea_orm::DatabaseConnection>,
        config: config::Config,
    ) -> error::Result<Self> {
        let broker = broker::Broker::new(db.clone());
        let rate_limiter = ratelimit::RateLimiter::new(db.clone());
        let suppression = suppression::SuppressionService::new(db.clone());
        let submission = submission::SubmissionService::new(
            db.clone(),
            broker.clone(),
            suppression.clone(),
        );
        let tracking = tracking::TrackingService::new(db.clone(), config.tracking_base_url.clone());
        let webhook =
            webhook::WebhookService::new(db.clone(), broker.clone(), config.webhook_timeout_seconds);
        let reputation = reputation::ReputationService::new(db.clone());
        let analytics = analytics::AnalyticsService::new(db.clone());
        let smtp = smtp::SmtpPool::new();
        let metrics = Arc::new(metrics::Metrics::new()?);

        Ok(Self {
            db,
            config: Arc::new(config),
            broker,
            rate_limiter,
            suppression,
            submission,
            tracking,
            webhook,
            reputation,
            analytics,
            smtp,
            metrics,
        })
    }

    /// The service bundle handed to every worker routine.
    pub fn worker_services(&self) -> Arc<worker::WorkerServices> {
        let bounce = worker::bounce::BounceProcessor::new(
            self.db.clone(),
            self.suppression.clone(),
            self.webhook.clone(),
        );
        Arc::new(worker::WorkerServices {
            db: self.db.clone(),
            broker: self.broker.clone(),
            smtp: self.smtp.clone(),
            suppression: self.suppression.clone(),
            tracking: self.tracking.clone(),
            webhook: self.webhook.clone(),
            rate_limiter: self.rate_limiter.clone(),
            reputation: self.reputation.clone(),
            analytics: self.analytics.clone(),
            bounce,
            metrics: self.metrics.clone(),
        })
    }
}
