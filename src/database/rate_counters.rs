use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rate_counters")]
pub struct Model {
    /// `{tier}:{id}:{window}` as built by the rate limiter.
    #[sea_orm(primary_key, auto_increment = false)]
    pub counter_key: String,
    pub window_start: i64, // Unix epoch seconds
    pub count: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
