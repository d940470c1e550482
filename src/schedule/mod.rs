//! Recurring email schedules: cron expressions fire template submissions.

use crate::database::{queues, scheduled_jobs};
use crate::error::{MailQueueError, Result};
use crate::submission::{EmailInput, SubmissionService};
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use handlebars::Handlebars;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::str::FromStr;
use std::sync::Arc;

/// Next fire time after `after`, evaluated in the schedule's timezone.
pub fn compute_next_run(
    cron_expression: &str,
    timezone: &str,
    after: chrono::DateTime<Utc>,
) -> Result<i64> {
    let schedule = CronSchedule::from_str(cron_expression)
        .map_err(|e| MailQueueError::InvalidInput(format!("Invalid cron expression: {e}")))?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| MailQueueError::InvalidInput(format!("Invalid timezone: {timezone}")))?;

    let next = schedule
        .after(&after.with_timezone(&tz))
        .next()
        .ok_or_else(|| MailQueueError::InvalidInput("Cron expression never fires".to_string()))?;
    Ok(next.with_timezone(&Utc).timestamp_micros())
}

/// Write-time validation for schedule create/update.
pub fn validate_expression(cron_expression: &str, timezone: &str) -> Result<()> {
    compute_next_run(cron_expression, timezone, Utc::now()).map(|_| ())
}

#[derive(Clone)]
pub struct SchedulerService {
    db: Arc<DatabaseConnection>,
    submission: SubmissionService,
    templates: Arc<Handlebars<'static>>,
}

impl SchedulerService {
    pub fn new(db: Arc<DatabaseConnection>, submission: SubmissionService) -> Self {
        Self {
            db,
            submission,
            templates: Arc::new(Handlebars::new()),
        }
    }

    /// One scheduler tick: fire every due active schedule and advance its
    /// next run time.
    pub async fn tick(&self) -> Result<u64> {
        let now = Utc::now();
        let now_micros = now.timestamp_micros();

        let due = scheduled_jobs::Entity::find()
            .filter(scheduled_jobs::Column::Active.eq(true))
            .filter(
                Condition::any()
                    .add(scheduled_jobs::Column::NextRunAt.lte(now_micros))
                    .add(scheduled_jobs::Column::NextRunAt.is_null()),
            )
            .all(&*self.db)
            .await?;

        let mut fired = 0;
        for job in due {
            // First sighting: seed the schedule without firing.
            if job.next_run_at.is_none() {
                match compute_next_run(&job.cron_expression, &job.timezone, now) {
                    Ok(next) => {
                        let mut active: scheduled_jobs::ActiveModel = job.into();
                        active.next_run_at = Set(Some(next));
                        active.updated_at = Set(now_micros);
                        active.update(&*self.db).await?;
                    }
                    Err(e) => {
                        tracing::error!("Unschedulable cron job: {}", e);
                    }
                }
                continue;
            }

            let job_id = job.id.clone();
            match self.fire(&job).await {
                Ok(()) => fired += 1,
                Err(e) => {
                    tracing::error!(schedule_id = %job_id, "Scheduled send failed: {}", e);
                }
            }

            // Advance even after a failed fire; a broken template must not
            // wedge the schedule into a hot loop.
            match compute_next_run(&job.cron_expression, &job.timezone, now) {
                Ok(next) => {
                    let mut active: scheduled_jobs::ActiveModel = job.into();
                    active.last_run_at = Set(Some(now_micros));
                    active.next_run_at = Set(Some(next));
                    active.updated_at = Set(now_micros);
                    active.update(&*self.db).await?;
                }
                Err(e) => {
                    tracing::error!(schedule_id = %job_id, "Failed to compute next run: {}", e);
                }
            }
        }

        if fired > 0 {
            tracing::info!(count = fired, "Fired scheduled emails");
        }
        Ok(fired)
    }

    async fn fire(&self, job: &scheduled_jobs::Model) -> Result<()> {
        let Some(queue) = queues::Entity::find_by_id(job.queue_id.clone())
            .one(&*self.db)
            .await?
        else {
            return Err(MailQueueError::InvalidInput(format!(
                "Schedule '{}' references a deleted queue",
                job.name
            )));
        };
        if queue.paused {
            tracing::warn!(schedule_id = %job.id, queue = %queue.name, "Queue paused, skipping fire");
            return Ok(());
        }

        let input = self.render_template(&job.template, &queue.name)?;
        self.submission
            .validate(&input)
            .map_err(|e| MailQueueError::InvalidInput(e.to_string()))?;
        self.submission
            .submit(&job.app_id, &queue, input, None)
            .await
            .map_err(|e| MailQueueError::InvalidInput(e.to_string()))?;

        tracing::info!(schedule_id = %job.id, queue = %queue.name, "Scheduled email submitted");
        Ok(())
    }

    /// The stored template is an email input bag whose subject and bodies
    /// may reference `variables` through handlebars placeholders.
    fn render_template(&self, template: &str, queue_name: &str) -> Result<EmailInput> {
        let mut bag: serde_json::Value = serde_json::from_str(template)?;
        if !bag.is_object() {
            return Err(MailQueueError::Template(
                "Schedule template must be a JSON object".to_string(),
            ));
        }
        let variables = bag
            .get("variables")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        for field in ["subject", "html", "text"] {
            if let Some(raw) = bag.get(field).and_then(|v| v.as_str()) {
                let rendered = self
                    .templates
                    .render_template(raw, &variables)
                    .map_err(|e| MailQueueError::Template(format!("{field}: {e}")))?;
                bag[field] = serde_json::Value::String(rendered);
            }
        }

        bag["queue"] = serde_json::Value::String(queue_name.to_string());
        if let Some(map) = bag.as_object_mut() {
            map.remove("variables");
        }

        Ok(serde_json::from_value(bag)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_advances_in_timezone() {
        let after = chrono::DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // Daily at 09:00 New York time (six-field cron: sec min hour dom mon dow)
        let next = compute_next_run("0 0 9 * * *", "America/New_York", after).unwrap();
        let next_dt = chrono::DateTime::from_timestamp_micros(next).unwrap();
        assert!(next_dt > after);
        // 09:00 EST == 14:00 UTC
        assert_eq!(next_dt.format("%H:%M").to_string(), "14:00");
    }

    #[test]
    fn invalid_expressions_are_rejected_at_write_time() {
        assert!(validate_expression("not a cron", "UTC").is_err());
        assert!(validate_expression("0 0 9 * * *", "Mars/Olympus").is_err());
        assert!(validate_expression("0 */5 * * * *", "UTC").is_ok());
    }
}
