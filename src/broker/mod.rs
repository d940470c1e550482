//! Durable job broker backed by the relational store.
//!
//! Lanes carry tagged job payloads with priority ordering, delayed
//! visibility and at-least-once leasing: a claim is an optimistic
//! `UPDATE ... WHERE status = 'pending'`, and claims that outlive the
//! visibility timeout are reclaimed for another worker.

use crate::database::jobs::{self, JobStatus};
use crate::error::{MailQueueError, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Email,
    Webhook,
    Tracking,
    Analytics,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Email => "email",
            Lane::Webhook => "webhook",
            Lane::Tracking => "tracking",
            Lane::Analytics => "analytics",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged union of everything the worker pool knows how to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    SendEmail {
        email_id: String,
        app_id: String,
        queue_id: String,
        priority: i32,
    },
    DeliverWebhook {
        delivery_id: String,
    },
    RecordTracking {
        email_id: String,
        event_type: String,
        data: serde_json::Value,
    },
    AggregateStats {
        app_id: String,
        event_type: String,
        occurred_at: i64,
    },
    UpdateReputation {
        app_id: String,
    },
    ProcessBounce {
        email_id: String,
        app_id: String,
        bounce_type: String,
        bounce_sub_type: Option<String>,
        bounce_message: Option<String>,
        bounced_recipients: Vec<String>,
        timestamp: i64,
    },
    ProcessComplaint {
        email_id: String,
        app_id: String,
        complaint_type: Option<String>,
        complained_recipients: Vec<String>,
        timestamp: i64,
    },
}

impl JobPayload {
    /// The email id this job is about, when there is one. Used by the
    /// reconciliation sweep to detect emails without a live job.
    pub fn email_id(&self) -> Option<&str> {
        match self {
            JobPayload::SendEmail { email_id, .. }
            | JobPayload::RecordTracking { email_id, .. }
            | JobPayload::ProcessBounce { email_id, .. }
            | JobPayload::ProcessComplaint { email_id, .. } => Some(email_id.as_str()),
            _ => None,
        }
    }
}

/// A job handed to a worker. Must be resolved with `ack` or `nack`; if the
/// holder crashes the claim expires and the job becomes leasable again.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: String,
    pub lane: String,
    pub payload: JobPayload,
    pub attempts: i32,
}

#[derive(Clone)]
pub struct Broker {
    db: Arc<DatabaseConnection>,
}

impl Broker {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        lane: Lane,
        priority: i32,
        delay_seconds: i64,
        payload: &JobPayload,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp_micros();
        let scheduled_at = now + delay_seconds.max(0) * 1_000_000;

        let model = jobs::ActiveModel {
            lane: Set(lane.as_str().to_string()),
            priority: Set(priority),
            payload: Set(serde_json::to_string(payload)?),
            scheduled_at: Set(scheduled_at),
            ..jobs::ActiveModel::new()
        };

        let inserted = model.insert(&*self.db).await?;
        tracing::debug!(
            job_id = %inserted.id,
            lane = %lane,
            delay_seconds,
            "Enqueued job"
        );
        Ok(inserted.id)
    }

    /// Claim the next due job on a lane, highest priority first. Returns
    /// None when the lane is empty or every candidate was claimed by a
    /// concurrent worker first.
    pub async fn lease(&self, lane: Lane, worker_id: &str) -> Result<Option<LeasedJob>> {
        let now = chrono::Utc::now().timestamp_micros();

        // A losing claimant retries against the next candidate a few times
        // before reporting an empty lane.
        for _ in 0..3 {
            let candidate = jobs::Entity::find()
                .filter(jobs::Column::Lane.eq(lane.as_str()))
                .filter(jobs::Column::Status.eq(JobStatus::Pending.as_str()))
                .filter(jobs::Column::ScheduledAt.lte(now))
                .order_by_desc(jobs::Column::Priority)
                .order_by_asc(jobs::Column::ScheduledAt)
                .one(&*self.db)
                .await?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            let claimed = jobs::Entity::update_many()
                .col_expr(jobs::Column::Status, Expr::value(JobStatus::Claimed.as_str()))
                .col_expr(jobs::Column::ClaimedAt, Expr::value(now))
                .col_expr(jobs::Column::ClaimedBy, Expr::value(worker_id))
                .col_expr(jobs::Column::Attempts, Expr::col(jobs::Column::Attempts).add(1))
                .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
                .filter(jobs::Column::Id.eq(&job.id))
                .filter(jobs::Column::Status.eq(JobStatus::Pending.as_str()))
                .exec(&*self.db)
                .await?;

            if claimed.rows_affected == 1 {
                let payload: JobPayload = serde_json::from_str(&job.payload)?;
                return Ok(Some(LeasedJob {
                    id: job.id,
                    lane: job.lane,
                    payload,
                    attempts: job.attempts + 1,
                }));
            }
            // Lost the race; try the next candidate.
        }

        Ok(None)
    }

    /// Acknowledge a leased job: the work is done, drop the row.
    pub async fn ack(&self, job_id: &str) -> Result<()> {
        jobs::Entity::delete_many()
            .filter(jobs::Column::Id.eq(job_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Return a leased job to its lane for a later attempt.
    pub async fn nack(&self, job_id: &str, delay_seconds: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let scheduled_at = now + delay_seconds.max(0) * 1_000_000;

        let updated = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Pending.as_str()))
            .col_expr(jobs::Column::ScheduledAt, Expr::value(scheduled_at))
            .col_expr(jobs::Column::ClaimedAt, Expr::value(Option::<i64>::None))
            .col_expr(jobs::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.eq(JobStatus::Claimed.as_str()))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(MailQueueError::Broker(format!(
                "nack of job {job_id} matched no claimed row"
            )));
        }
        Ok(())
    }

    /// Reset claims older than the visibility timeout so crashed workers
    /// do not strand jobs.
    pub async fn reclaim_expired(&self, visibility_timeout_seconds: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp_micros();
        let cutoff = now - visibility_timeout_seconds * 1_000_000;

        let reclaimed = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Pending.as_str()))
            .col_expr(jobs::Column::ClaimedAt, Expr::value(Option::<i64>::None))
            .col_expr(jobs::Column::ClaimedBy, Expr::value(Option::<String>::None))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Status.eq(JobStatus::Claimed.as_str()))
            .filter(jobs::Column::ClaimedAt.lt(cutoff))
            .exec(&*self.db)
            .await?;

        if reclaimed.rows_affected > 0 {
            tracing::warn!(
                count = reclaimed.rows_affected,
                "Reclaimed jobs from expired leases"
            );
        }
        Ok(reclaimed.rows_affected)
    }

    /// Whether a live (pending or claimed) job whose payload references the
    /// given id exists on a lane. Used by the reconciliation sweeps.
    pub async fn has_live_job(&self, lane: Lane, payload_needle: &str) -> Result<bool> {
        let count = jobs::Entity::find()
            .filter(jobs::Column::Lane.eq(lane.as_str()))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Claimed.as_str(),
            ]))
            .filter(jobs::Column::Payload.contains(payload_needle))
            .count(&*self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn pending_count(&self, lane: Lane) -> Result<u64> {
        let count = jobs::Entity::find()
            .filter(jobs::Column::Lane.eq(lane.as_str()))
            .filter(jobs::Column::Status.eq(JobStatus::Pending.as_str()))
            .count(&*self.db)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_with_kebab_case_tag() {
        let payload = JobPayload::SendEmail {
            email_id: "e1".to_string(),
            app_id: "a1".to_string(),
            queue_id: "q1".to_string(),
            priority: 5,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""type":"send-email""#));

        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn payload_email_id_is_exposed_for_reconciliation() {
        let payload = JobPayload::SendEmail {
            email_id: "e1".to_string(),
            app_id: "a1".to_string(),
            queue_id: "q1".to_string(),
            priority: 5,
        };
        assert_eq!(payload.email_id(), Some("e1"));

        let payload = JobPayload::UpdateReputation {
            app_id: "a1".to_string(),
        };
        assert_eq!(payload.email_id(), None);
    }
}
