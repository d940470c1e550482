//! Outbound webhook delivery with HMAC-SHA256 signing.
//!
//! Every state transition that subscribers care about becomes a persisted
//! `webhook_deliveries` row plus a job on the webhook lane. Failed posts
//! walk a fixed retry curve and go terminal after the fifth attempt; a
//! periodic sweeper rescues due deliveries whose job was lost.

use crate::auth::constant_time_eq;
use crate::broker::{Broker, JobPayload, Lane};
use crate::database::{apps, emails, webhook_deliveries};
use crate::error::Result;
use hmac::{Hmac, Mac};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QuerySelect, Set,
};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const USER_AGENT: &str = "MailQueue-Webhook/1.0";
/// Retry delays in seconds for attempts 1 through 5.
pub const RETRY_DELAYS: [i64; 5] = [60, 300, 1800, 3600, 14400];
pub const MAX_ATTEMPTS: i32 = 5;
const ERROR_EXCERPT_LEN: usize = 200;

/// `sha256=<hex>` over `"<timestamp>.<payload>"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side verification; constant-time over the hex digest.
pub fn verify_signature(secret: &str, timestamp: i64, payload: &str, header: &str) -> bool {
    let expected = sign_payload(secret, timestamp, payload);
    constant_time_eq(expected.as_bytes(), header.as_bytes())
}

#[derive(Clone)]
pub struct WebhookService {
    db: Arc<DatabaseConnection>,
    broker: Broker,
    client: reqwest::Client,
}

impl WebhookService {
    pub fn new(db: Arc<DatabaseConnection>, broker: Broker, timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { db, broker, client }
    }

    /// Snapshot an event for the app's subscriber and queue the delivery.
    /// Apps without a webhook URL are skipped silently.
    pub async fn publish(
        &self,
        app: &apps::Model,
        email: Option<&emails::Model>,
        queue_name: Option<&str>,
        event_type: &str,
        event_data: Option<serde_json::Value>,
    ) -> Result<()> {
        if app.webhook_url.is_none() || app.webhook_secret.is_none() {
            return Ok(());
        }

        let now = chrono::Utc::now();
        let payload = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "type": event_type,
            "timestamp": now.to_rfc3339(),
            "data": {
                "emailId": email.map(|e| e.id.clone()),
                "messageId": email.and_then(|e| e.message_id.clone()),
                "appId": app.id,
                "queueName": queue_name,
                "from": email.map(|e| e.from_email.clone()),
                "to": email.map(|e| e.to_recipients().iter().map(|r| r.email.clone()).collect::<Vec<_>>()),
                "subject": email.map(|e| e.subject.clone()),
                "status": email.map(|e| e.status.clone()),
                "metadata": email
                    .and_then(|e| e.metadata.as_deref())
                    .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok()),
                "event": event_data,
            },
        });

        let delivery = webhook_deliveries::ActiveModel {
            app_id: Set(app.id.clone()),
            email_id: Set(email.map(|e| e.id.clone())),
            event_type: Set(event_type.to_string()),
            payload: Set(serde_json::to_string(&payload)?),
            next_retry_at: Set(Some(now.timestamp_micros())),
            ..webhook_deliveries::ActiveModel::new()
        };
        let delivery = delivery.insert(&*self.db).await?;

        self.broker
            .enqueue(
                Lane::Webhook,
                5,
                0,
                &JobPayload::DeliverWebhook {
                    delivery_id: delivery.id.clone(),
                },
            )
            .await?;

        tracing::debug!(
            delivery_id = %delivery.id,
            event_type,
            "Queued webhook delivery"
        );
        Ok(())
    }

    /// Job handler: POST the snapshot to the subscriber, signed.
    pub async fn deliver(&self, delivery_id: &str) -> Result<()> {
        let Some(delivery) = webhook_deliveries::Entity::find_by_id(delivery_id.to_string())
            .one(&*self.db)
            .await?
        else {
            tracing::warn!(delivery_id, "Webhook delivery row missing, dropping job");
            return Ok(());
        };

        if delivery.status != "pending" {
            return Ok(());
        }

        let Some(app) = apps::Entity::find_by_id(delivery.app_id.clone())
            .one(&*self.db)
            .await?
        else {
            tracing::warn!(delivery_id, "App gone, abandoning webhook delivery");
            return Ok(());
        };
        let (Some(url), Some(secret)) = (app.webhook_url.as_deref(), app.webhook_secret.as_deref())
        else {
            tracing::debug!(delivery_id, "App no longer has a webhook subscriber");
            return Ok(());
        };

        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign_payload(secret, timestamp, &delivery.payload);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Id", &delivery.id)
            .header("X-Webhook-Timestamp", timestamp.to_string())
            .header("X-Webhook-Signature", &signature)
            .body(delivery.payload.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                self.mark_delivered(delivery).await?;
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let excerpt: String = body.chars().take(ERROR_EXCERPT_LEN).collect();
                self.record_failure(delivery, format!("HTTP {status}: {excerpt}"))
                    .await?;
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    "Request timeout".to_string()
                } else {
                    e.to_string().chars().take(ERROR_EXCERPT_LEN).collect()
                };
                self.record_failure(delivery, message).await?;
            }
        }
        Ok(())
    }

    async fn mark_delivered(&self, delivery: webhook_deliveries::Model) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let delivery_id = delivery.id.clone();
        let attempts = delivery.attempts + 1;
        let mut active: webhook_deliveries::ActiveModel = delivery.into();
        active.status = Set("delivered".to_string());
        active.attempts = Set(attempts);
        active.delivered_at = Set(Some(now));
        active.next_retry_at = Set(None);
        active.last_error = Set(None);
        active.update(&*self.db).await?;
        tracing::info!(delivery_id = %delivery_id, "Webhook delivered");
        Ok(())
    }

    async fn record_failure(
        &self,
        delivery: webhook_deliveries::Model,
        error: String,
    ) -> Result<()> {
        let attempts = delivery.attempts + 1;
        let now = chrono::Utc::now().timestamp_micros();
        let delivery_id = delivery.id.clone();

        let mut active: webhook_deliveries::ActiveModel = delivery.into();
        active.attempts = Set(attempts);
        active.last_error = Set(Some(error.clone()));

        if attempts >= MAX_ATTEMPTS {
            active.status = Set("failed".to_string());
            active.next_retry_at = Set(None);
            active.update(&*self.db).await?;
            tracing::error!(
                delivery_id = %delivery_id,
                attempts,
                error = %error,
                "Webhook delivery failed permanently"
            );
        } else {
            let delay = RETRY_DELAYS[(attempts - 1) as usize];
            active.next_retry_at = Set(Some(now + delay * 1_000_000));
            active.update(&*self.db).await?;

            self.broker
                .enqueue(
                    Lane::Webhook,
                    5,
                    delay,
                    &JobPayload::DeliverWebhook {
                        delivery_id: delivery_id.clone(),
                    },
                )
                .await?;

            tracing::warn!(
                delivery_id = %delivery_id,
                attempt = attempts,
                retry_in_seconds = delay,
                error = %error,
                "Webhook delivery failed, retry scheduled"
            );
        }
        Ok(())
    }

    /// Re-enqueue pending deliveries that are due but have no live job
    /// (lost to a crash between the DB write and the enqueue).
    pub async fn sweep_due(&self, limit: u64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_micros();
        let due = webhook_deliveries::Entity::find()
            .filter(webhook_deliveries::Column::Status.eq("pending"))
            .filter(webhook_deliveries::Column::NextRetryAt.lte(now))
            .limit(limit)
            .all(&*self.db)
            .await?;

        let mut requeued = 0;
        for delivery in due {
            if self.broker.has_live_job(Lane::Webhook, &delivery.id).await? {
                continue;
            }
            self.broker
                .enqueue(
                    Lane::Webhook,
                    5,
                    0,
                    &JobPayload::DeliverWebhook {
                        delivery_id: delivery.id.clone(),
                    },
                )
                .await?;
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!(count = requeued, "Requeued stranded webhook deliveries");
        }
        Ok(requeued)
    }
}
