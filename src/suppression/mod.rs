//! Per-app and global recipient blocklist.
//!
//! Entries are keyed by `(app_id, address)` where a null app id means the
//! entry is global and applies to every tenant. Complaints outrank every
//! other reason; soft bounces expire after seven days.

use crate::database::email_events::{self, EventType};
use crate::database::emails;
use crate::database::suppression_list::{self, SuppressionReason};
use crate::error::{MailQueueError, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::str::FromStr;
use std::sync::Arc;

const SOFT_BOUNCE_TTL_MICROS: i64 = 7 * 24 * 60 * 60 * 1_000_000;

pub const CSV_HEADER: &str = "email_address,reason,expires_at,created_at";

/// Lowercase, trimmed form used for every comparison and stored value.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct SuppressionCheck {
    pub is_suppressed: bool,
    pub reason: Option<SuppressionReason>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub added: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub imported: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct SuppressionService {
    db: Arc<DatabaseConnection>,
}

impl SuppressionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Upsert an entry. A complaint upgrades any existing reason and clears
    /// the expiry; any other reason leaves an existing entry untouched.
    /// Unsubscribes with a known source email also append an `unsubscribed`
    /// event to that email's history.
    /// Returns true when a row was created or upgraded.
    pub async fn add(
        &self,
        app_id: Option<&str>,
        address: &str,
        reason: SuppressionReason,
        source_email_id: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let address = normalize_address(address);
        let now = chrono::Utc::now().timestamp_micros();

        let expires_at = match (reason, expires_at) {
            (SuppressionReason::Complaint, _) => None,
            (SuppressionReason::SoftBounce, None) => Some(now + SOFT_BOUNCE_TTL_MICROS),
            (_, explicit) => explicit,
        };

        let existing = self.find_entry(app_id, &address).await?;

        let added = match existing {
            Some(entry) => {
                let current =
                    SuppressionReason::from_str(&entry.reason).unwrap_or(SuppressionReason::Manual);
                if current == SuppressionReason::Complaint {
                    false
                } else if reason == SuppressionReason::Complaint {
                    let mut active: suppression_list::ActiveModel = entry.into();
                    active.reason = Set(reason.to_string());
                    active.expires_at = Set(None);
                    if let Some(source) = source_email_id {
                        active.source_email_id = Set(Some(source.to_string()));
                    }
                    active.update(&*self.db).await?;
                    true
                } else {
                    false
                }
            }
            None => {
                let model = suppression_list::ActiveModel {
                    app_id: Set(app_id.map(|s| s.to_string())),
                    email_address: Set(address.clone()),
                    reason: Set(reason.to_string()),
                    source_email_id: Set(source_email_id.map(|s| s.to_string())),
                    expires_at: Set(expires_at),
                    ..suppression_list::ActiveModel::new()
                };
                match model.insert(&*self.db).await {
                    Ok(_) => true,
                    // Unique (app_id, address) race: another writer created
                    // the entry first, which is the same outcome as skipped.
                    Err(e) if e.to_string().to_lowercase().contains("unique") => false,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // The unsubscribe itself is an engagement fact about the email it
        // came through, whether or not a new entry was created.
        if reason == SuppressionReason::Unsubscribe {
            if let Some(source) = source_email_id {
                self.record_unsubscribe(source, &address).await?;
            }
        }

        Ok(added)
    }

    async fn record_unsubscribe(&self, email_id: &str, address: &str) -> Result<()> {
        let exists = emails::Entity::find_by_id(email_id.to_string())
            .one(&*self.db)
            .await?
            .is_some();
        if !exists {
            tracing::debug!(email_id, "Unsubscribe source email missing, skipping event");
            return Ok(());
        }
        email_events::append(
            &*self.db,
            email_id,
            EventType::Unsubscribed,
            serde_json::json!({ "address": address }),
        )
        .await?;
        Ok(())
    }

    pub async fn add_bulk(
        &self,
        app_id: Option<&str>,
        entries: &[(String, SuppressionReason, Option<i64>)],
    ) -> Result<BulkResult> {
        let mut result = BulkResult::default();
        for (address, reason, expires_at) in entries {
            if self.add(app_id, address, *reason, None, *expires_at).await? {
                result.added += 1;
            } else {
                result.skipped += 1;
            }
        }
        Ok(result)
    }

    pub async fn remove(&self, app_id: Option<&str>, address: &str) -> Result<bool> {
        let address = normalize_address(address);
        let mut delete = suppression_list::Entity::delete_many()
            .filter(suppression_list::Column::EmailAddress.eq(&address));
        delete = match app_id {
            Some(id) => delete.filter(suppression_list::Column::AppId.eq(id)),
            None => delete.filter(suppression_list::Column::AppId.is_null()),
        };
        let result = delete.exec(&*self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Check `(app, addr)` and `(global, addr)`, ignoring expired entries.
    pub async fn check(&self, app_id: &str, address: &str) -> Result<SuppressionCheck> {
        let address = normalize_address(address);
        let now = chrono::Utc::now().timestamp_micros();

        let entry = suppression_list::Entity::find()
            .filter(suppression_list::Column::EmailAddress.eq(&address))
            .filter(
                Condition::any()
                    .add(suppression_list::Column::AppId.eq(app_id))
                    .add(suppression_list::Column::AppId.is_null()),
            )
            .filter(
                Condition::any()
                    .add(suppression_list::Column::ExpiresAt.is_null())
                    .add(suppression_list::Column::ExpiresAt.gt(now)),
            )
            .one(&*self.db)
            .await?;

        Ok(match entry {
            Some(entry) => SuppressionCheck {
                is_suppressed: true,
                reason: SuppressionReason::from_str(&entry.reason).ok(),
                expires_at: entry.expires_at,
            },
            None => SuppressionCheck {
                is_suppressed: false,
                reason: None,
                expires_at: None,
            },
        })
    }

    /// First suppressed address among the given recipients, if any.
    pub async fn first_suppressed(
        &self,
        app_id: &str,
        addresses: &[String],
    ) -> Result<Option<(String, SuppressionReason)>> {
        for address in addresses {
            let check = self.check(app_id, address).await?;
            if check.is_suppressed {
                return Ok(Some((
                    normalize_address(address),
                    check.reason.unwrap_or(SuppressionReason::Manual),
                )));
            }
        }
        Ok(None)
    }

    /// Point the entry's source at the email it most recently blocked.
    pub async fn update_source(
        &self,
        app_id: &str,
        address: &str,
        source_email_id: &str,
    ) -> Result<()> {
        let address = normalize_address(address);
        suppression_list::Entity::update_many()
            .col_expr(
                suppression_list::Column::SourceEmailId,
                Expr::value(Some(source_email_id.to_string())),
            )
            .filter(suppression_list::Column::EmailAddress.eq(&address))
            .filter(
                Condition::any()
                    .add(suppression_list::Column::AppId.eq(app_id))
                    .add(suppression_list::Column::AppId.is_null()),
            )
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn list(
        &self,
        app_id: Option<&str>,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<suppression_list::Model>, u64)> {
        let mut query = suppression_list::Entity::find();
        query = match app_id {
            Some(id) => query.filter(suppression_list::Column::AppId.eq(id)),
            None => query.filter(suppression_list::Column::AppId.is_null()),
        };

        let total = query.clone().count(&*self.db).await?;
        let entries = query
            .order_by_desc(suppression_list::Column::CreatedAt)
            .order_by_desc(suppression_list::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(&*self.db)
            .await?;
        Ok((entries, total))
    }

    /// CSV with header `email_address,reason,expires_at,created_at`;
    /// ISO-8601 timestamps, empty when missing.
    pub async fn export_csv(&self, app_id: Option<&str>) -> Result<String> {
        let mut query = suppression_list::Entity::find();
        query = match app_id {
            Some(id) => query.filter(suppression_list::Column::AppId.eq(id)),
            None => query.filter(suppression_list::Column::AppId.is_null()),
        };
        let entries = query
            .order_by_asc(suppression_list::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["email_address", "reason", "expires_at", "created_at"])
            .map_err(|e| MailQueueError::InvalidInput(format!("CSV write error: {e}")))?;

        for entry in entries {
            let expires_at = entry.expires_at.map(micros_to_rfc3339).unwrap_or_default();
            let created_at = micros_to_rfc3339(entry.created_at);
            writer
                .write_record([
                    entry.email_address.as_str(),
                    entry.reason.as_str(),
                    expires_at.as_str(),
                    created_at.as_str(),
                ])
                .map_err(|e| MailQueueError::InvalidInput(format!("CSV write error: {e}")))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| MailQueueError::InvalidInput(format!("CSV write error: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| MailQueueError::InvalidInput(format!("CSV encoding error: {e}")))
    }

    /// Import rows in the export format. Invalid rows are reported in the
    /// errors array without aborting the rest of the file.
    pub async fn import_csv(&self, app_id: Option<&str>, data: &str) -> Result<ImportResult> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data.as_bytes());

        let mut result = ImportResult::default();

        for (index, record) in reader.records().enumerate() {
            let line = index + 2; // 1-based, after the header
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    result.errors.push(format!("line {line}: {e}"));
                    continue;
                }
            };

            let address = record.get(0).map(normalize_address).unwrap_or_default();
            if address.is_empty() || !address.contains('@') {
                result
                    .errors
                    .push(format!("line {line}: invalid email address"));
                continue;
            }

            let reason = match record.get(1).map(str::trim) {
                Some(raw) if !raw.is_empty() => match SuppressionReason::from_str(raw) {
                    Ok(reason) => reason,
                    Err(e) => {
                        result.errors.push(format!("line {line}: {e}"));
                        continue;
                    }
                },
                _ => SuppressionReason::Manual,
            };

            let expires_at = match record.get(2).map(str::trim) {
                Some("") | None => None,
                Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
                    Ok(dt) => Some(dt.timestamp_micros()),
                    Err(e) => {
                        result
                            .errors
                            .push(format!("line {line}: invalid expires_at: {e}"));
                        continue;
                    }
                },
            };

            if self.add(app_id, &address, reason, None, expires_at).await? {
                result.imported += 1;
            } else {
                result.skipped += 1;
            }
        }

        Ok(result)
    }

    async fn find_entry(
        &self,
        app_id: Option<&str>,
        address: &str,
    ) -> Result<Option<suppression_list::Model>> {
        let mut query = suppression_list::Entity::find()
            .filter(suppression_list::Column::EmailAddress.eq(address));
        query = match app_id {
            Some(id) => query.filter(suppression_list::Column::AppId.eq(id)),
            None => query.filter(suppression_list::Column::AppId.is_null()),
        };
        Ok(query.one(&*self.db).await?)
    }
}

fn micros_to_rfc3339(micros: i64) -> String {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_normalized() {
        assert_eq!(normalize_address("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn rfc3339_round_trip_keeps_second_precision() {
        let micros = 1_700_000_000_000_000;
        let rendered = micros_to_rfc3339(micros);
        let parsed = chrono::DateTime::parse_from_rfc3339(&rendered).unwrap();
        assert_eq!(parsed.timestamp_micros(), micros);
    }
}
