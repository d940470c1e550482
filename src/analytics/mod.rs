//! Time-bucketed engagement and delivery counters.
//!
//! Email events flow through the analytics lane into hourly per-app
//! counters; the query side reads those buckets plus live email rows.

use crate::database::{analytics_counters, emails};
use crate::error::Result;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;

const HOUR_MICROS: i64 = 60 * 60 * 1_000_000;

/// Start of the hour bucket containing the given instant.
pub fn bucket_start(occurred_at_micros: i64) -> i64 {
    occurred_at_micros - occurred_at_micros.rem_euclid(HOUR_MICROS)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total: u64,
    pub queued: u64,
    pub sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub delivery_rate: f64,
    pub bounce_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementStats {
    pub opens: u64,
    pub clicks: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketPoint {
    pub bucket_start: String,
    pub event_type: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct AnalyticsService {
    db: Arc<DatabaseConnection>,
}

impl AnalyticsService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Bump the hourly counter for an event. Idempotence at this layer is
    /// per `(app, bucket, type)`; raw events stay append-only elsewhere.
    pub async fn bump(&self, app_id: &str, event_type: &str, occurred_at: i64) -> Result<()> {
        let bucket = bucket_start(occurred_at);

        let updated = analytics_counters::Entity::update_many()
            .col_expr(
                analytics_counters::Column::Count,
                Expr::col(analytics_counters::Column::Count).add(1),
            )
            .filter(analytics_counters::Column::AppId.eq(app_id))
            .filter(analytics_counters::Column::BucketStart.eq(bucket))
            .filter(analytics_counters::Column::EventType.eq(event_type))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            let insert = analytics_counters::ActiveModel {
                app_id: Set(app_id.to_string()),
                bucket_start: Set(bucket),
                event_type: Set(event_type.to_string()),
                count: Set(1),
                ..analytics_counters::ActiveModel::new()
            }
            .insert(&*self.db)
            .await;

            if insert.is_err() {
                analytics_counters::Entity::update_many()
                    .col_expr(
                        analytics_counters::Column::Count,
                        Expr::col(analytics_counters::Column::Count).add(1),
                    )
                    .filter(analytics_counters::Column::AppId.eq(app_id))
                    .filter(analytics_counters::Column::BucketStart.eq(bucket))
                    .filter(analytics_counters::Column::EventType.eq(event_type))
                    .exec(&*self.db)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn overview(&self, app_id: &str) -> Result<OverviewStats> {
        let count_status = |status: &'static str| {
            let db = self.db.clone();
            let app_id = app_id.to_string();
            async move {
                emails::Entity::find()
                    .filter(emails::Column::AppId.eq(&app_id))
                    .filter(emails::Column::Status.eq(status))
                    .count(&*db)
                    .await
            }
        };

        let total = emails::Entity::find()
            .filter(emails::Column::AppId.eq(app_id))
            .count(&*self.db)
            .await?;

        Ok(OverviewStats {
            total,
            queued: count_status("queued").await?,
            sent: count_status("sent").await?,
            delivered: count_status("delivered").await?,
            bounced: count_status("bounced").await?,
            failed: count_status("failed").await?,
        })
    }

    pub async fn delivery(&self, app_id: &str) -> Result<DeliveryStats> {
        let overview = self.overview(app_id).await?;
        let attempted = overview.sent + overview.delivered + overview.bounced;
        let (delivery_rate, bounce_rate) = if attempted == 0 {
            (0.0, 0.0)
        } else {
            (
                (overview.sent + overview.delivered) as f64 / attempted as f64 * 100.0,
                overview.bounced as f64 / attempted as f64 * 100.0,
            )
        };
        Ok(DeliveryStats {
            sent: overview.sent,
            delivered: overview.delivered,
            bounced: overview.bounced,
            delivery_rate,
            bounce_rate,
        })
    }

    pub async fn engagement(&self, app_id: &str) -> Result<EngagementStats> {
        let opens = self.counter_total(app_id, "opened").await?;
        let clicks = self.counter_total(app_id, "clicked").await?;
        let delivered_or_sent = {
            let overview = self.overview(app_id).await?;
            overview.sent + overview.delivered
        };
        let (open_rate, click_rate) = if delivered_or_sent == 0 {
            (0.0, 0.0)
        } else {
            (
                opens as f64 / delivered_or_sent as f64 * 100.0,
                clicks as f64 / delivered_or_sent as f64 * 100.0,
            )
        };
        Ok(EngagementStats {
            opens,
            clicks,
            open_rate,
            click_rate,
        })
    }

    /// Hourly bounce buckets, most recent first.
    pub async fn bounce_buckets(&self, app_id: &str, limit: u64) -> Result<Vec<BucketPoint>> {
        let buckets = analytics_counters::Entity::find()
            .filter(analytics_counters::Column::AppId.eq(app_id))
            .filter(analytics_counters::Column::EventType.eq("bounced"))
            .order_by_desc(analytics_counters::Column::BucketStart)
            .paginate(&*self.db, limit.max(1))
            .fetch_page(0)
            .await?;

        Ok(buckets
            .into_iter()
            .map(|b| BucketPoint {
                bucket_start: chrono::DateTime::from_timestamp_micros(b.bucket_start)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default(),
                event_type: b.event_type,
                count: b.count,
            })
            .collect())
    }

    async fn counter_total(&self, app_id: &str, event_type: &str) -> Result<u64> {
        let rows = analytics_counters::Entity::find()
            .filter(analytics_counters::Column::AppId.eq(app_id))
            .filter(analytics_counters::Column::EventType.eq(event_type))
            .all(&*self.db)
            .await?;
        Ok(rows.iter().map(|r| r.count.max(0) as u64).sum())
    }
}
