//! Hierarchical fixed-window rate limiting.
//!
//! Counters live in the shared store so every API process and worker sees
//! the same windows. Keys are `{tier}:{id}:{window_index}`; a window index
//! is `floor(now / window_seconds)`.

use crate::database::rate_counters;
use crate::error::Result;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    ApiKey,
    AppDaily,
    Queue,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::ApiKey => "apiKey",
            Tier::AppDaily => "appDaily",
            Tier::Queue => "queue",
        }
    }

    pub fn window_seconds(&self) -> i64 {
        match self {
            Tier::ApiKey => 60,
            Tier::AppDaily => 86400,
            Tier::Queue => 60,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier to evaluate. A `None` limit skips the tier entirely.
#[derive(Debug, Clone)]
pub struct TierCheck {
    pub tier: Tier,
    pub id: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TierDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Epoch seconds at which the window rolls over.
    pub reset_at: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub blocked_by: Option<Tier>,
    pub decisions: Vec<(Tier, TierDecision)>,
}

impl RateLimitOutcome {
    pub fn decision_for(&self, tier: Tier) -> Option<&TierDecision> {
        self.decisions.iter().find(|(t, _)| *t == tier).map(|(_, d)| d)
    }

    /// Seconds until the blocking tier's window resets.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        let blocked = self.blocked_by?;
        let decision = self.decision_for(blocked)?;
        let now = chrono::Utc::now().timestamp();
        Some((decision.reset_at - now).max(1) as u64)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    db: Arc<DatabaseConnection>,
}

impl RateLimiter {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn counter_key(tier: Tier, id: &str, now_secs: i64) -> (String, i64) {
        let window = now_secs / tier.window_seconds();
        (format!("{}:{}:{}", tier.as_str(), id, window), window)
    }

    /// Evaluate tiers in order and, when every tier allows, increment all
    /// counters once. The submission path calls this; dispatch only
    /// re-checks.
    pub async fn acquire(&self, checks: &[TierCheck]) -> Result<RateLimitOutcome> {
        let outcome = self.evaluate(checks, true).await?;
        if outcome.allowed {
            for check in checks {
                if check.limit.is_some() {
                    self.increment(check).await?;
                }
            }
        }
        Ok(outcome)
    }

    /// Read-only evaluation, used by the worker before dispatch.
    pub async fn check(&self, checks: &[TierCheck]) -> Result<RateLimitOutcome> {
        self.evaluate(checks, false).await
    }

    async fn evaluate(&self, checks: &[TierCheck], reserving: bool) -> Result<RateLimitOutcome> {
        let now_secs = chrono::Utc::now().timestamp();
        let mut decisions = Vec::new();
        let mut blocked_by = None;

        for check in checks {
            let Some(limit) = check.limit else {
                continue;
            };

            let (key, window) = Self::counter_key(check.tier, &check.id, now_secs);
            let count = rate_counters::Entity::find_by_id(key)
                .one(&*self.db)
                .await?
                .map(|c| c.count)
                .unwrap_or(0);

            let reset_at = (window + 1) * check.tier.window_seconds();
            // When reserving, this request occupies a slot on success.
            let used_after = if reserving { count + 1 } else { count };
            let allowed = count < limit;
            let remaining = if allowed { (limit - used_after).max(0) } else { 0 };

            decisions.push((
                check.tier,
                TierDecision {
                    allowed,
                    limit,
                    remaining,
                    reset_at,
                },
            ));

            if !allowed && blocked_by.is_none() {
                blocked_by = Some(check.tier);
                break;
            }
        }

        Ok(RateLimitOutcome {
            allowed: blocked_by.is_none(),
            blocked_by,
            decisions,
        })
    }

    async fn increment(&self, check: &TierCheck) -> Result<()> {
        let now_secs = chrono::Utc::now().timestamp();
        let (key, window) = Self::counter_key(check.tier, &check.id, now_secs);
        let window_start = window * check.tier.window_seconds();

        let updated = rate_counters::Entity::update_many()
            .col_expr(
                rate_counters::Column::Count,
                Expr::col(rate_counters::Column::Count).add(1),
            )
            .filter(rate_counters::Column::CounterKey.eq(&key))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            let insert = rate_counters::ActiveModel {
                counter_key: Set(key.clone()),
                window_start: Set(window_start),
                count: Set(1),
            }
            .insert(&*self.db)
            .await;

            // A concurrent writer may have created the row first.
            if insert.is_err() {
                rate_counters::Entity::update_many()
                    .col_expr(
                        rate_counters::Column::Count,
                        Expr::col(rate_counters::Column::Count).add(1),
                    )
                    .filter(rate_counters::Column::CounterKey.eq(&key))
                    .exec(&*self.db)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop counters from windows that ended before the cutoff.
    pub async fn cleanup_expired(&self, older_than_seconds: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - older_than_seconds;
        let deleted = rate_counters::Entity::delete_many()
            .filter(rate_counters::Column::WindowStart.lt(cutoff))
            .exec(&*self.db)
            .await?;
        Ok(deleted.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_keys_are_window_scoped() {
        let (key_a, window_a) = RateLimiter::counter_key(Tier::ApiKey, "k1", 120);
        assert_eq!(key_a, "apiKey:k1:2");
        assert_eq!(window_a, 2);

        let (key_b, _) = RateLimiter::counter_key(Tier::ApiKey, "k1", 179);
        assert_eq!(key_a, key_b);

        let (key_c, _) = RateLimiter::counter_key(Tier::ApiKey, "k1", 180);
        assert_ne!(key_a, key_c);
    }

    #[test]
    fn daily_tier_uses_day_window() {
        let (key, window) = RateLimiter::counter_key(Tier::AppDaily, "a1", 86400 * 3 + 55);
        assert_eq!(window, 3);
        assert_eq!(key, "appDaily:a1:3");
    }
}
