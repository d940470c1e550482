//! Bounce and complaint processing.
//!
//! DSNs land here as jobs: status and events are updated, bouncing
//! recipients feed the suppression index and subscribers are notified.

use crate::broker::JobPayload;
use crate::database::email_events::{self, EventType};
use crate::database::suppression_list::SuppressionReason;
use crate::database::{apps, emails, queues};
use crate::error::Result;
use crate::suppression::SuppressionService;
use crate::webhook::WebhookService;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;

#[derive(Clone)]
pub struct BounceProcessor {
    db: Arc<DatabaseConnection>,
    suppression: SuppressionService,
    webhook: WebhookService,
}

impl BounceProcessor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        suppression: SuppressionService,
        webhook: WebhookService,
    ) -> Self {
        Self {
            db,
            suppression,
            webhook,
        }
    }

    pub async fn process_bounce(&self, payload: &JobPayload) -> Result<()> {
        let JobPayload::ProcessBounce {
            email_id,
            app_id,
            bounce_type,
            bounce_sub_type,
            bounce_message,
            bounced_recipients,
            timestamp,
        } = payload
        else {
            return Ok(());
        };

        let Some(email) = emails::Entity::find_by_id(email_id.clone())
            .one(&*self.db)
            .await?
        else {
            tracing::warn!(email_id = %email_id, "Bounce for unknown email, dropping");
            return Ok(());
        };

        // Terminal emails keep their status; the event and suppression are
        // still recorded. A losing writer sees zero rows and moves on.
        let now = chrono::Utc::now().timestamp_micros();
        emails::Entity::update_many()
            .col_expr(emails::Column::Status, Expr::value("bounced"))
            .col_expr(emails::Column::UpdatedAt, Expr::value(now))
            .filter(emails::Column::Id.eq(email_id))
            .filter(emails::Column::Status.is_in(["queued", "processing", "sent"]))
            .exec(&*self.db)
            .await?;

        let event_data = serde_json::json!({
            "bounceType": bounce_type,
            "bounceSubType": bounce_sub_type,
            "bounceMessage": bounce_message,
            "bouncedRecipients": bounced_recipients,
            "timestamp": timestamp,
        });
        email_events::append(&*self.db, email_id, EventType::Bounced, event_data.clone()).await?;

        let reason = if bounce_type == "soft" {
            SuppressionReason::SoftBounce
        } else {
            SuppressionReason::HardBounce
        };
        for recipient in bounced_recipients {
            self.suppression
                .add(Some(app_id.as_str()), recipient, reason, Some(email_id.as_str()), None)
                .await?;
        }

        self.emit(&email, "email.bounced", event_data).await?;
        tracing::info!(
            email_id = %email_id,
            bounce_type = %bounce_type,
            recipients = bounced_recipients.len(),
            "Processed bounce"
        );
        Ok(())
    }

    pub async fn process_complaint(&self, payload: &JobPayload) -> Result<()> {
        let JobPayload::ProcessComplaint {
            email_id,
            app_id,
            complaint_type,
            complained_recipients,
            timestamp,
        } = payload
        else {
            return Ok(());
        };

        let Some(email) = emails::Entity::find_by_id(email_id.clone())
            .one(&*self.db)
            .await?
        else {
            tracing::warn!(email_id = %email_id, "Complaint for unknown email, dropping");
            return Ok(());
        };

        let event_data = serde_json::json!({
            "complaintType": complaint_type,
            "complainedRecipients": complained_recipients,
            "timestamp": timestamp,
        });
        email_events::append(&*self.db, email_id, EventType::Complained, event_data.clone())
            .await?;

        for recipient in complained_recipients {
            self.suppression
                .add(
                    Some(app_id.as_str()),
                    recipient,
                    SuppressionReason::Complaint,
                    Some(email_id.as_str()),
                    None,
                )
                .await?;
        }

        self.emit(&email, "email.complained", event_data).await?;
        tracing::info!(
            email_id = %email_id,
            recipients = complained_recipients.len(),
            "Processed complaint"
        );
        Ok(())
    }

    async fn emit(
        &self,
        email: &emails::Model,
        event_type: &str,
        event_data: serde_json::Value,
    ) -> Result<()> {
        let Some(app) = apps::Entity::find_by_id(email.app_id.clone())
            .one(&*self.db)
            .await?
        else {
            return Ok(());
        };
        let queue_name = queues::Entity::find_by_id(email.queue_id.clone())
            .one(&*self.db)
            .await?
            .map(|q| q.name);

        // Re-read so the payload snapshot carries the post-update status.
        let email = emails::Entity::find_by_id(email.id.clone())
            .one(&*self.db)
            .await?
            .unwrap_or_else(|| email.clone());

        let event = serde_json::json!({
            "type": event_type,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": event_data,
        });
        self.webhook
            .publish(&app, Some(&email), queue_name.as_deref(), event_type, Some(event))
            .await
    }
}
