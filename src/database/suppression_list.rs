use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "suppression_list")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Null means the entry is global and applies to every tenant.
    pub app_id: Option<String>,
    /// Lowercase, trimmed.
    pub email_address: String,
    pub reason: String,
    pub source_email_id: Option<String>,
    pub expires_at: Option<i64>, // Unix epoch microseconds
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7().to_string()),
            created_at: Set(chrono::Utc::now().timestamp_micros()),
            ..ActiveModelTrait::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    SoftBounce,
    Complaint,
    Unsubscribe,
    Manual,
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressionReason::HardBounce => write!(f, "hard_bounce"),
            SuppressionReason::SoftBounce => write!(f, "soft_bounce"),
            SuppressionReason::Complaint => write!(f, "complaint"),
            SuppressionReason::Unsubscribe => write!(f, "unsubscribe"),
            SuppressionReason::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for SuppressionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard_bounce" => Ok(SuppressionReason::HardBounce),
            "soft_bounce" => Ok(SuppressionReason::SoftBounce),
            "complaint" => Ok(SuppressionReason::Complaint),
            "unsubscribe" => Ok(SuppressionReason::Unsubscribe),
            "manual" => Ok(SuppressionReason::Manual),
            other => Err(format!("Unknown suppression reason: {other}")),
        }
    }
}
