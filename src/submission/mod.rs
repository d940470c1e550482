//! Submission pipeline: validate, resolve, idempotency-check, persist and
//! enqueue. The email row and its first event are written in one
//! transaction; the broker enqueue happens after commit with a
//! reconciliation sweep covering the crash window in between.

use crate::broker::{Broker, JobPayload, Lane};
use crate::database::email_events::{self, EventType};
use crate::database::emails::{self, EmailStatus, Recipient};
use crate::database::queues;
use crate::error::{ApiError, ErrorCode, Result};
use crate::suppression::SuppressionService;
use regex::Regex;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Unclosed non-void tags tolerated before HTML is rejected as malformed.
const HTML_UNCLOSED_TOLERANCE: usize = 2;
const DEFAULT_RETRY_PRIORITY: i32 = 5;

fn address_regex() -> &'static Regex {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        // RFC 5322 simple form: printable local part, dotted domain labels.
        Regex::new(r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$")
            .expect("static regex")
    })
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9]*)[^>]*?(/?)>").expect("static regex"))
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

pub fn is_valid_address(address: &str) -> bool {
    address_regex().is_match(address)
}

/// Reject only clearly malformed documents: more unclosed non-void tags
/// than the tolerance allows.
pub fn html_is_acceptable(html: &str) -> bool {
    let mut open: i64 = 0;
    for captures in tag_regex().captures_iter(html) {
        let closing = &captures[1] == "/";
        let name = captures[2].to_lowercase();
        let self_closing = &captures[3] == "/";

        if VOID_ELEMENTS.contains(&name.as_str()) || self_closing {
            continue;
        }
        if closing {
            open -= 1;
        } else {
            open += 1;
        }
    }
    open.unsigned_abs() as usize <= HTML_UNCLOSED_TOLERANCE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailInput {
    pub queue: String,
    pub from: Recipient,
    pub to: Vec<Recipient>,
    #[serde(default)]
    pub cc: Vec<Recipient>,
    #[serde(default)]
    pub bcc: Vec<Recipient>,
    pub reply_to: Option<Recipient>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub personalization: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub id: String,
    pub status: String,
    pub queued_at: String,
}

#[derive(Clone)]
pub struct SubmissionService {
    db: Arc<DatabaseConnection>,
    broker: Broker,
    suppression: SuppressionService,
}

impl SubmissionService {
    pub fn new(db: Arc<DatabaseConnection>, broker: Broker, suppression: SuppressionService) -> Self {
        Self {
            db,
            broker,
            suppression,
        }
    }

    /// Structural validation: addresses first, then HTML sanity, then
    /// recipient and body presence; short-circuits at the first failing
    /// step. Failures carry path+message detail pairs.
    pub fn validate(&self, input: &EmailInput) -> std::result::Result<(), ApiError> {
        let mut details: Vec<serde_json::Value> = Vec::new();
        let mut push = |details: &mut Vec<serde_json::Value>, path: String, message: &str| {
            details.push(serde_json::json!({ "path": path, "message": message }));
        };

        // 1. Addresses
        if !is_valid_address(&input.from.email) {
            push(&mut details, "from.email".into(), "is not a valid email address");
        }
        for (index, recipient) in input.to.iter().enumerate() {
            if !is_valid_address(&recipient.email) {
                push(&mut details, format!("to[{index}].email"), "is not a valid email address");
            }
        }
        for (index, recipient) in input.cc.iter().enumerate() {
            if !is_valid_address(&recipient.email) {
                push(&mut details, format!("cc[{index}].email"), "is not a valid email address");
            }
        }
        for (index, recipient) in input.bcc.iter().enumerate() {
            if !is_valid_address(&recipient.email) {
                push(&mut details, format!("bcc[{index}].email"), "is not a valid email address");
            }
        }
        if let Some(reply_to) = &input.reply_to {
            if !is_valid_address(&reply_to.email) {
                push(&mut details, "replyTo.email".into(), "is not a valid email address");
            }
        }
        if !details.is_empty() {
            return Err(ApiError::validation("Email submission failed validation")
                .with_details(serde_json::Value::Array(details)));
        }

        // 2. HTML sanity
        if let Some(html) = input.html.as_deref() {
            if !html_is_acceptable(html) {
                push(&mut details, "html".into(), "document is malformed (unclosed tags)");
                return Err(ApiError::validation("Email submission failed validation")
                    .with_details(serde_json::Value::Array(details)));
            }
        }

        // 3. Recipient count and body presence
        if input.to.len() + input.cc.len() + input.bcc.len() == 0 {
            push(&mut details, "to".into(), "at least one recipient is required");
        }
        if input.html.as_deref().map_or(true, str::is_empty)
            && input.text.as_deref().map_or(true, str::is_empty)
        {
            push(&mut details, "html".into(), "either html or text body is required");
        }

        if details.is_empty() {
            Ok(())
        } else {
            Err(ApiError::validation("Email submission failed validation")
                .with_details(serde_json::Value::Array(details)))
        }
    }

    pub async fn resolve_queue(
        &self,
        app_id: &str,
        queue_name: &str,
    ) -> std::result::Result<queues::Model, ApiError> {
        let queue = queues::Entity::find()
            .filter(queues::Column::AppId.eq(app_id))
            .filter(queues::Column::Name.eq(queue_name))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::QueueNotFound,
                    format!("Queue '{queue_name}' does not exist"),
                )
            })?;

        if queue.paused {
            return Err(ApiError::new(
                ErrorCode::QueuePaused,
                format!("Queue '{queue_name}' is paused"),
            ));
        }
        Ok(queue)
    }

    /// Persist and enqueue an already-validated submission.
    pub async fn submit(
        &self,
        app_id: &str,
        queue: &queues::Model,
        input: EmailInput,
        idempotency_key: Option<String>,
    ) -> std::result::Result<emails::Model, ApiError> {
        // Idempotent replay: hand back the original email id.
        if let Some(key) = idempotency_key.as_deref() {
            let existing = emails::Entity::find()
                .filter(emails::Column::AppId.eq(app_id))
                .filter(emails::Column::IdempotencyKey.eq(key))
                .one(&*self.db)
                .await?;
            if let Some(existing) = existing {
                return Err(ApiError::new(
                    ErrorCode::IdempotencyConflict,
                    "An email with this idempotency key already exists",
                )
                .with_details(serde_json::json!({ "emailId": existing.id })));
            }
        }

        // Any suppressed recipient rejects the whole submission.
        let addresses: Vec<String> = input
            .to
            .iter()
            .chain(input.cc.iter())
            .chain(input.bcc.iter())
            .map(|r| r.email.clone())
            .collect();
        if let Some((address, reason)) = self
            .suppression
            .first_suppressed(app_id, &addresses)
            .await
            .map_err(ApiError::from)?
        {
            return Err(ApiError::new(
                ErrorCode::SuppressedEmail,
                format!("Recipient '{address}' is suppressed ({reason})"),
            )
            .with_details(serde_json::json!({ "address": address, "reason": reason.to_string() })));
        }

        let now = chrono::Utc::now();
        let scheduled_at = input.scheduled_at.map(|dt| dt.timestamp_micros());
        let delay_seconds = scheduled_at
            .map(|at| (at - now.timestamp_micros()) / 1_000_000)
            .filter(|d| *d > 0)
            .unwrap_or(0);

        let txn = self.db.begin().await.map_err(ApiError::from)?;

        let model = emails::ActiveModel {
            app_id: Set(app_id.to_string()),
            queue_id: Set(queue.id.clone()),
            idempotency_key: Set(idempotency_key),
            from_email: Set(input.from.email.clone()),
            from_name: Set(input.from.name.clone()),
            to_recipients: Set(serde_json::to_string(&input.to).unwrap_or_else(|_| "[]".into())),
            cc_recipients: Set(serialize_optional_list(&input.cc)),
            bcc_recipients: Set(serialize_optional_list(&input.bcc)),
            reply_to: Set(input
                .reply_to
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok())),
            subject: Set(input.subject.clone()),
            html_body: Set(input.html.clone()),
            text_body: Set(input.text.clone()),
            headers: Set(input
                .headers
                .as_ref()
                .and_then(|h| serde_json::to_string(h).ok())),
            personalization: Set(input.personalization.as_ref().map(|p| p.to_string())),
            metadata: Set(input.metadata.as_ref().map(|m| m.to_string())),
            scheduled_at: Set(scheduled_at),
            ..emails::ActiveModel::new()
        };

        let email = match model.insert(&txn).await {
            Ok(email) => email,
            Err(e) if e.to_string().to_lowercase().contains("unique") => {
                // Lost an idempotency race to a concurrent writer.
                txn.rollback().await.ok();
                return Err(ApiError::new(
                    ErrorCode::IdempotencyConflict,
                    "An email with this idempotency key already exists",
                ));
            }
            Err(e) => {
                txn.rollback().await.ok();
                return Err(e.into());
            }
        };

        email_events::append(&txn, &email.id, EventType::Queued, serde_json::json!({}))
            .await
            .map_err(ApiError::from)?;

        txn.commit().await.map_err(ApiError::from)?;

        // Best-effort after commit; the reconciliation sweep covers a crash
        // landing exactly here.
        let payload = JobPayload::SendEmail {
            email_id: email.id.clone(),
            app_id: app_id.to_string(),
            queue_id: queue.id.clone(),
            priority: queue.priority,
        };
        if let Err(e) = self
            .broker
            .enqueue(Lane::Email, queue.priority, delay_seconds, &payload)
            .await
        {
            tracing::error!(
                email_id = %email.id,
                "Failed to enqueue send job, relying on reconciliation: {}",
                e
            );
        }

        tracing::info!(
            email_id = %email.id,
            queue = %queue.name,
            delayed = delay_seconds > 0,
            "Email accepted"
        );
        Ok(email)
    }

    /// Cancel a queued email. Any other status is a validation error.
    pub async fn cancel(&self, app_id: &str, email_id: &str) -> std::result::Result<(), ApiError> {
        let email = self.load_owned(app_id, email_id).await?;

        let now = chrono::Utc::now().timestamp_micros();
        let updated = emails::Entity::update_many()
            .col_expr(emails::Column::Status, Expr::value("cancelled"))
            .col_expr(emails::Column::UpdatedAt, Expr::value(now))
            .filter(emails::Column::Id.eq(&email.id))
            .filter(emails::Column::Status.eq(EmailStatus::Queued.to_string()))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ApiError::validation(format!(
                "Only queued emails can be cancelled (current status: {})",
                email.status
            )));
        }

        email_events::append(
            &*self.db,
            &email.id,
            EventType::Cancelled,
            serde_json::json!({}),
        )
        .await
        .map_err(ApiError::from)?;
        Ok(())
    }

    /// Re-queue a failed email with default priority.
    pub async fn retry(
        &self,
        app_id: &str,
        email_id: &str,
    ) -> std::result::Result<emails::Model, ApiError> {
        let email = self.load_owned(app_id, email_id).await?;
        let previous_attempts = email.retry_count;

        let now = chrono::Utc::now().timestamp_micros();
        let updated = emails::Entity::update_many()
            .col_expr(emails::Column::Status, Expr::value("queued"))
            .col_expr(emails::Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(emails::Column::UpdatedAt, Expr::value(now))
            .filter(emails::Column::Id.eq(&email.id))
            .filter(emails::Column::Status.eq(EmailStatus::Failed.to_string()))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ApiError::validation(format!(
                "Only failed emails can be retried (current status: {})",
                email.status
            )));
        }

        email_events::append(
            &*self.db,
            &email.id,
            EventType::Queued,
            serde_json::json!({ "retry": true, "previousAttempts": previous_attempts }),
        )
        .await
        .map_err(ApiError::from)?;

        self.broker
            .enqueue(
                Lane::Email,
                DEFAULT_RETRY_PRIORITY,
                0,
                &JobPayload::SendEmail {
                    email_id: email.id.clone(),
                    app_id: app_id.to_string(),
                    queue_id: email.queue_id.clone(),
                    priority: DEFAULT_RETRY_PRIORITY,
                },
            )
            .await
            .map_err(ApiError::from)?;

        Ok(emails::Entity::find_by_id(email.id.clone())
            .one(&*self.db)
            .await?
            .unwrap_or(email))
    }

    /// Startup and periodic sweep: re-enqueue due `queued` emails with no
    /// live job, and rescue `processing` emails whose lease expired.
    pub async fn reconcile(&self, visibility_timeout_seconds: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_micros();
        let mut recovered = 0;

        let due = emails::Entity::find()
            .filter(emails::Column::Status.eq(EmailStatus::Queued.to_string()))
            .filter(
                Condition::any()
                    .add(emails::Column::ScheduledAt.is_null())
                    .add(emails::Column::ScheduledAt.lte(now)),
            )
            .limit(500)
            .all(&*self.db)
            .await?;

        for email in due {
            if self.broker.has_live_job(Lane::Email, &email.id).await? {
                continue;
            }
            let priority = queues::Entity::find_by_id(email.queue_id.clone())
                .one(&*self.db)
                .await?
                .map(|q| q.priority)
                .unwrap_or(DEFAULT_RETRY_PRIORITY);
            self.broker
                .enqueue(
                    Lane::Email,
                    priority,
                    0,
                    &JobPayload::SendEmail {
                        email_id: email.id.clone(),
                        app_id: email.app_id.clone(),
                        queue_id: email.queue_id.clone(),
                        priority,
                    },
                )
                .await?;
            recovered += 1;
        }

        // Processing emails past the lease timeout lost their worker.
        let stale_cutoff = now - visibility_timeout_seconds * 1_000_000;
        let stale = emails::Entity::find()
            .filter(emails::Column::Status.eq(EmailStatus::Processing.to_string()))
            .filter(emails::Column::UpdatedAt.lt(stale_cutoff))
            .limit(500)
            .all(&*self.db)
            .await?;

        for email in stale {
            if self.broker.has_live_job(Lane::Email, &email.id).await? {
                continue;
            }
            let reset = emails::Entity::update_many()
                .col_expr(emails::Column::Status, Expr::value("queued"))
                .col_expr(emails::Column::UpdatedAt, Expr::value(now))
                .filter(emails::Column::Id.eq(&email.id))
                .filter(emails::Column::Status.eq(EmailStatus::Processing.to_string()))
                .exec(&*self.db)
                .await?;
            if reset.rows_affected == 0 {
                continue;
            }
            self.broker
                .enqueue(
                    Lane::Email,
                    DEFAULT_RETRY_PRIORITY,
                    0,
                    &JobPayload::SendEmail {
                        email_id: email.id.clone(),
                        app_id: email.app_id.clone(),
                        queue_id: email.queue_id.clone(),
                        priority: DEFAULT_RETRY_PRIORITY,
                    },
                )
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "Reconciled stranded emails");
        }
        Ok(recovered)
    }

    async fn load_owned(
        &self,
        app_id: &str,
        email_id: &str,
    ) -> std::result::Result<emails::Model, ApiError> {
        emails::Entity::find_by_id(email_id.to_string())
            .filter(emails::Column::AppId.eq(app_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ApiError::not_found("Email not found"))
    }
}

fn serialize_optional_list(recipients: &[Recipient]) -> Option<String> {
    if recipients.is_empty() {
        None
    } else {
        serde_json::to_string(recipients).ok()
    }
}

pub fn receipt(email: &emails::Model) -> SubmissionReceipt {
    SubmissionReceipt {
        id: email.id.clone(),
        status: email.status.clone(),
        queued_at: chrono::DateTime::from_timestamp_micros(email.created_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_addresses() {
        assert!(is_valid_address("user@example.com"));
        assert!(is_valid_address("first.last+tag@sub.example.io"));
        assert!(!is_valid_address("user@"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("user example.com"));
        assert!(!is_valid_address("user@localhost"));
    }

    #[test]
    fn html_tolerance_allows_minor_sloppiness() {
        assert!(html_is_acceptable("<html><body><p>Hi</p></body></html>"));
        // One unclosed tag is within tolerance
        assert!(html_is_acceptable("<div><p>Hi</div>"));
        // Void elements do not count as unclosed
        assert!(html_is_acceptable("<body><br><img src=\"x\"><hr></body>"));
        // Clearly malformed
        assert!(!html_is_acceptable("<div><div><div><section><article>text"));
    }

    #[test]
    fn self_closing_tags_are_ignored() {
        assert!(html_is_acceptable("<body><custom-tag /><p>ok</p></body>"));
    }
}
