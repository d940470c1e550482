use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub app_id: String,
    pub name: String,
    /// Plain key prefix, e.g. `mq_live_a1b2c3d4`. Used for credential lookup.
    pub prefix: String,
    /// SHA-256 hex of the full plaintext key. The plaintext is never stored.
    pub key_hash: String,
    /// JSON array of scope strings.
    pub scopes: String,
    pub rate_limit: Option<i64>,
    /// JSON array of allowed IP strings; null means any.
    pub ip_allowlist: Option<String>,
    pub expires_at: Option<i64>,
    pub active: bool,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::apps::Entity",
        from = "Column::AppId",
        to = "super::apps::Column::Id"
    )]
    App,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7().to_string()),
            scopes: Set("[]".to_string()),
            active: Set(true),
            created_at: Set(chrono::Utc::now().timestamp_micros()),
            ..ActiveModelTrait::default()
        }
    }
}
