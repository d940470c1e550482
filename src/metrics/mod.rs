//! Prometheus metrics, served on a dedicated port.

use crate::error::{MailQueueError, Result};
use axum::{response::IntoResponse, routing::get, Json, Router};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde_json::json;
use std::sync::Arc;

const PROCESSING_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
const SMTP_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

pub struct Metrics {
    registry: Registry,
    pub emails_processed_total: IntCounterVec,
    pub email_processing_duration_seconds: HistogramVec,
    pub email_retries_total: IntCounterVec,
    pub smtp_connections_active: IntGaugeVec,
    pub smtp_send_duration_seconds: HistogramVec,
    pub smtp_errors_total: IntCounterVec,
    pub active_jobs: IntGauge,
    pub worker_status: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let emails_processed_total = IntCounterVec::new(
            Opts::new(
                "mailqueue_worker_emails_processed_total",
                "Emails processed by final status",
            ),
            &["app_id", "queue", "status"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let email_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mailqueue_worker_email_processing_duration_seconds",
                "End-to-end processing time per send job",
            )
            .buckets(PROCESSING_BUCKETS.to_vec()),
            &["app_id", "queue"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let email_retries_total = IntCounterVec::new(
            Opts::new(
                "mailqueue_worker_email_retries_total",
                "Send retries scheduled",
            ),
            &["app_id", "queue"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let smtp_connections_active = IntGaugeVec::new(
            Opts::new(
                "mailqueue_worker_smtp_connections_active",
                "Open SMTP transports per relay host",
            ),
            &["host"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let smtp_send_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mailqueue_worker_smtp_send_duration_seconds",
                "SMTP send round-trip time",
            )
            .buckets(SMTP_BUCKETS.to_vec()),
            &["host", "status"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let smtp_errors_total = IntCounterVec::new(
            Opts::new("mailqueue_worker_smtp_errors_total", "SMTP failures by kind"),
            &["host", "error_type"],
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let active_jobs = IntGauge::new(
            "mailqueue_worker_active_jobs",
            "Jobs currently held by workers",
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        let worker_status = IntGauge::new(
            "mailqueue_worker_status",
            "1 while the worker pool is running, 0 otherwise",
        )
        .map_err(|e| MailQueueError::Config(format!("metrics: {e}")))?;

        registry
            .register(Box::new(emails_processed_total.clone()))
            .and_then(|_| registry.register(Box::new(email_processing_duration_seconds.clone())))
            .and_then(|_| registry.register(Box::new(email_retries_total.clone())))
            .and_then(|_| registry.register(Box::new(smtp_connections_active.clone())))
            .and_then(|_| registry.register(Box::new(smtp_send_duration_seconds.clone())))
            .and_then(|_| registry.register(Box::new(smtp_errors_total.clone())))
            .and_then(|_| registry.register(Box::new(active_jobs.clone())))
            .and_then(|_| registry.register(Box::new(worker_status.clone())))
            .map_err(|e| MailQueueError::Config(format!("metrics registration: {e}")))?;

        Ok(Self {
            registry,
            emails_processed_total,
            email_processing_duration_seconds,
            email_retries_total,
            smtp_connections_active,
            smtp_send_duration_seconds,
            smtp_errors_total,
            active_jobs,
            worker_status,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

pub fn routes(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { metrics.render().into_response() }
            }),
        )
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "healthy" })) }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_required_series() {
        let metrics = Metrics::new().unwrap();
        metrics
            .emails_processed_total
            .with_label_values(&["app", "tx", "sent"])
            .inc();
        metrics
            .email_processing_duration_seconds
            .with_label_values(&["app", "tx"])
            .observe(0.3);
        metrics
            .email_retries_total
            .with_label_values(&["app", "tx"])
            .inc();
        metrics
            .smtp_connections_active
            .with_label_values(&["smtp.example.com"])
            .set(1);
        metrics
            .smtp_send_duration_seconds
            .with_label_values(&["smtp.example.com", "success"])
            .observe(0.1);
        metrics
            .smtp_errors_total
            .with_label_values(&["smtp.example.com", "timeout"])
            .inc();
        metrics.active_jobs.set(2);
        metrics.worker_status.set(1);

        let rendered = metrics.render();
        for series in [
            "mailqueue_worker_emails_processed_total",
            "mailqueue_worker_email_processing_duration_seconds",
            "mailqueue_worker_email_retries_total",
            "mailqueue_worker_smtp_connections_active",
            "mailqueue_worker_smtp_send_duration_seconds",
            "mailqueue_worker_smtp_errors_total",
            "mailqueue_worker_active_jobs",
            "mailqueue_worker_status",
        ] {
            assert!(rendered.contains(series), "missing series {series}");
        }
    }
}
