use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub email_id: String,
    pub event_type: String,
    /// JSON data bag.
    pub event_data: String,
    pub created_at: i64, // Unix epoch microseconds
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::emails::Entity",
        from = "Column::EmailId",
        to = "super::emails::Column::Id"
    )]
    Email,
}

impl Related<super::emails::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Email.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7().to_string()),
            event_data: Set("{}".to_string()),
            created_at: Set(chrono::Utc::now().timestamp_micros()),
            ..ActiveModelTrait::default()
        }
    }
}

/// Append an event row. Events are append-only and ordered by created_at
/// within an email.
pub async fn append<C>(
    conn: &C,
    email_id: &str,
    event_type: EventType,
    data: serde_json::Value,
) -> Result<Model, DbErr>
where
    C: sea_orm::ConnectionTrait,
{
    let model = ActiveModel {
        email_id: Set(email_id.to_string()),
        event_type: Set(event_type.to_string()),
        event_data: Set(data.to_string()),
        ..ActiveModel::new()
    };
    model.insert(conn).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Queued,
    Processing,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Queued => write!(f, "queued"),
            EventType::Processing => write!(f, "processing"),
            EventType::Sent => write!(f, "sent"),
            EventType::Delivered => write!(f, "delivered"),
            EventType::Opened => write!(f, "opened"),
            EventType::Clicked => write!(f, "clicked"),
            EventType::Bounced => write!(f, "bounced"),
            EventType::Complained => write!(f, "complained"),
            EventType::Unsubscribed => write!(f, "unsubscribed"),
            EventType::Failed => write!(f, "failed"),
            EventType::Cancelled => write!(f, "cancelled"),
        }
    }
}
