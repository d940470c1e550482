//! Sender reputation: rolling 24 h bounce and complaint rates per app,
//! reduced to a 0-100 score and a throttle flag the dispatch path honours.

use crate::database::{app_reputation, email_events, emails};
use crate::error::Result;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QuerySelect, Set,
};
use std::sync::Arc;

const WINDOW_MICROS: i64 = 24 * 60 * 60 * 1_000_000;
const BOUNCE_THROTTLE_THRESHOLD: f64 = 10.0;
const COMPLAINT_THROTTLE_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ReputationSnapshot {
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub score: f64,
    pub throttled: bool,
    pub throttle_reason: Option<String>,
}

/// Pure scoring step, shared by the engine and its tests.
pub fn score(sent: u64, bounces: u64, complaints: u64) -> ReputationSnapshot {
    let (bounce_rate, complaint_rate) = if sent == 0 {
        (0.0, 0.0)
    } else {
        (
            bounces as f64 / sent as f64 * 100.0,
            complaints as f64 / sent as f64 * 100.0,
        )
    };

    let score = (100.0 - 2.0 * bounce_rate - 20.0 * complaint_rate).clamp(0.0, 100.0);

    let throttle_reason = if bounce_rate > BOUNCE_THROTTLE_THRESHOLD {
        Some(format!("bounce rate {bounce_rate:.1}% exceeds 10%"))
    } else if complaint_rate > COMPLAINT_THROTTLE_THRESHOLD {
        Some(format!("complaint rate {complaint_rate:.1}% exceeds 1%"))
    } else {
        None
    };

    ReputationSnapshot {
        bounce_rate,
        complaint_rate,
        score,
        throttled: throttle_reason.is_some(),
        throttle_reason,
    }
}

#[derive(Clone)]
pub struct ReputationService {
    db: Arc<DatabaseConnection>,
}

impl ReputationService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn is_throttled(&self, app_id: &str) -> Result<bool> {
        Ok(app_reputation::Entity::find_by_id(app_id.to_string())
            .one(&*self.db)
            .await?
            .map(|r| r.throttled)
            .unwrap_or(false))
    }

    pub async fn get(&self, app_id: &str) -> Result<Option<app_reputation::Model>> {
        Ok(app_reputation::Entity::find_by_id(app_id.to_string())
            .one(&*self.db)
            .await?)
    }

    pub async fn recompute_app(&self, app_id: &str) -> Result<ReputationSnapshot> {
        let window_start = chrono::Utc::now().timestamp_micros() - WINDOW_MICROS;

        let sent = emails::Entity::find()
            .filter(emails::Column::AppId.eq(app_id))
            .filter(emails::Column::Status.is_in(["sent", "delivered", "bounced"]))
            .filter(emails::Column::UpdatedAt.gte(window_start))
            .count(&*self.db)
            .await?;

        let bounces = emails::Entity::find()
            .filter(emails::Column::AppId.eq(app_id))
            .filter(emails::Column::Status.eq("bounced"))
            .filter(emails::Column::UpdatedAt.gte(window_start))
            .count(&*self.db)
            .await?;

        let complaints = email_events::Entity::find()
            .inner_join(emails::Entity)
            .filter(email_events::Column::EventType.eq("complained"))
            .filter(email_events::Column::CreatedAt.gte(window_start))
            .filter(emails::Column::AppId.eq(app_id))
            .count(&*self.db)
            .await?;

        let snapshot = score(sent, bounces, complaints);
        self.upsert(app_id, &snapshot).await?;

        if snapshot.throttled {
            tracing::warn!(
                app_id,
                bounce_rate = snapshot.bounce_rate,
                complaint_rate = snapshot.complaint_rate,
                "App throttled by reputation engine"
            );
        }
        Ok(snapshot)
    }

    /// Recompute every app with email activity inside the window.
    pub async fn recompute_recent(&self) -> Result<u64> {
        let window_start = chrono::Utc::now().timestamp_micros() - WINDOW_MICROS;

        let app_ids: Vec<String> = emails::Entity::find()
            .select_only()
            .column(emails::Column::AppId)
            .filter(emails::Column::UpdatedAt.gte(window_start))
            .distinct()
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut updated = 0;
        for app_id in app_ids {
            if let Err(e) = self.recompute_app(&app_id).await {
                tracing::error!(app_id = %app_id, "Reputation recompute failed: {}", e);
                continue;
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn upsert(&self, app_id: &str, snapshot: &ReputationSnapshot) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let existing = app_reputation::Entity::find_by_id(app_id.to_string())
            .one(&*self.db)
            .await?;

        match existing {
            Some(existing) => {
                let mut active: app_reputation::ActiveModel = existing.into();
                active.bounce_rate = Set(snapshot.bounce_rate);
                active.complaint_rate = Set(snapshot.complaint_rate);
                active.score = Set(snapshot.score);
                active.throttled = Set(snapshot.throttled);
                active.throttle_reason = Set(snapshot.throttle_reason.clone());
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
            }
            None => {
                let active = app_reputation::ActiveModel {
                    app_id: Set(app_id.to_string()),
                    bounce_rate: Set(snapshot.bounce_rate),
                    complaint_rate: Set(snapshot.complaint_rate),
                    score: Set(snapshot.score),
                    throttled: Set(snapshot.throttled),
                    throttle_reason: Set(snapshot.throttle_reason.clone()),
                    updated_at: Set(now),
                };
                active.insert(&*self.db).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sent_means_perfect_score() {
        let snapshot = score(0, 0, 0);
        assert_eq!(snapshot.bounce_rate, 0.0);
        assert_eq!(snapshot.complaint_rate, 0.0);
        assert_eq!(snapshot.score, 100.0);
        assert!(!snapshot.throttled);
    }

    #[test]
    fn score_follows_the_formula() {
        // 100 sent, 5 bounces, 1 complaint: 100 - 2*5 - 20*1 = 70
        let snapshot = score(100, 5, 1);
        assert!((snapshot.score - 70.0).abs() < f64::EPSILON);
        assert!(!snapshot.throttled); // 5% bounce, 1% complaint: under both
    }

    #[test]
    fn score_clamps_at_zero() {
        let snapshot = score(10, 10, 10);
        assert_eq!(snapshot.score, 0.0);
        assert!(snapshot.throttled);
    }

    #[test]
    fn bounce_trigger_wins_over_complaint_in_reason() {
        let snapshot = score(100, 20, 5);
        assert!(snapshot.throttled);
        assert!(snapshot.throttle_reason.unwrap().contains("bounce rate"));
    }

    #[test]
    fn complaint_rate_above_one_percent_throttles() {
        let snapshot = score(1000, 0, 11);
        assert!(snapshot.throttled);
        assert!(snapshot.throttle_reason.unwrap().contains("complaint rate"));
    }
}
