use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub app_id: String,
    pub queue_id: String,
    pub idempotency_key: Option<String>,
    /// Remote message id reported by the receiving relay.
    pub message_id: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    /// JSON array of {email, name?} objects.
    pub to_recipients: String,
    pub cc_recipients: Option<String>,
    pub bcc_recipients: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// JSON object of extra headers.
    pub headers: Option<String>,
    pub personalization: Option<String>,
    pub metadata: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<i64>, // Unix epoch microseconds
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
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
    #[sea_orm(
        belongs_to = "super::queues::Entity",
        from = "Column::QueueId",
        to = "super::queues::Column::Id"
    )]
    Queue,
    #[sea_orm(has_many = "super::email_events::Entity")]
    Events,
}

impl Related<super::apps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::queues::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Queue.def()
    }
}

impl Related<super::email_events::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Events.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp_micros();
        Self {
            id: Set(Uuid::now_v7().to_string()),
            status: Set("queued".to_string()),
            retry_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

/// A single address + optional display name, as stored in the recipient
/// list JSON columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Model {
    pub fn to_recipients(&self) -> Vec<Recipient> {
        serde_json::from_str(&self.to_recipients).unwrap_or_default()
    }

    pub fn cc_recipients(&self) -> Vec<Recipient> {
        self.cc_recipients
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn bcc_recipients(&self) -> Vec<Recipient> {
        self.bcc_recipients
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    /// All recipient addresses across to/cc/bcc, in submission order.
    pub fn all_recipient_addresses(&self) -> Vec<String> {
        self.to_recipients()
            .into_iter()
            .chain(self.cc_recipients())
            .chain(self.bcc_recipients())
            .map(|r| r.email)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Queued,
    Processing,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Cancelled,
}

impl EmailStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailStatus::Delivered | EmailStatus::Bounced | EmailStatus::Failed | EmailStatus::Cancelled
        )
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailStatus::Queued => write!(f, "queued"),
            EmailStatus::Processing => write!(f, "processing"),
            EmailStatus::Sent => write!(f, "sent"),
            EmailStatus::Delivered => write!(f, "delivered"),
            EmailStatus::Bounced => write!(f, "bounced"),
            EmailStatus::Failed => write!(f, "failed"),
            EmailStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for EmailStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => EmailStatus::Queued,
            "processing" => EmailStatus::Processing,
            "sent" => EmailStatus::Sent,
            "delivered" => EmailStatus::Delivered,
            "bounced" => EmailStatus::Bounced,
            "failed" => EmailStatus::Failed,
            "cancelled" => EmailStatus::Cancelled,
            _ => EmailStatus::Queued,
        }
    }
}
