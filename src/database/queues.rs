use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_RETRY_DELAYS: [i64; 5] = [30, 120, 600, 3600, 86400];

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "queues")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub app_id: String,
    pub name: String,
    /// Dispatch priority 1-10, higher first.
    pub priority: i32,
    /// Per-minute send cap; null means uncapped.
    pub rate_limit: Option<i64>,
    pub max_retries: i32,
    /// JSON array of retry delays in seconds.
    pub retry_delays: String,
    pub smtp_config_id: Option<String>,
    pub paused: bool,
    /// JSON settings bag; `trackingEnabled` lives here.
    pub settings: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::apps::Entity",
        from = "Column::AppId",
        to = "super::apps::Column::Id"
    )]
    App,
    #[sea_orm(has_many = "super::emails::Entity")]
    Emails,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::emails::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Emails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp_micros();
        Self {
            id: Set(Uuid::now_v7().to_string()),
            priority: Set(5),
            max_retries: Set(5),
            retry_delays: Set("[30,120,600,3600,86400]".to_string()),
            paused: Set(false),
            settings: Set("{}".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

impl Model {
    pub fn retry_delays(&self) -> Vec<i64> {
        serde_json::from_str(&self.retry_delays).unwrap_or_else(|_| DEFAULT_RETRY_DELAYS.to_vec())
    }

    pub fn tracking_enabled(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.settings)
            .ok()
            .and_then(|v| v.get("trackingEnabled").and_then(|t| t.as_bool()))
            .unwrap_or(false)
    }
}
