use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A batch/quantity line on a dispatch. Unit cost and price are captured from
/// the batch at add-time; receipt reconciliation fills the received, damaged
/// and missing counts at delivery.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dispatch_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub dispatch_id: Uuid,
    pub batch_id: Uuid,

    pub quantity: i32,
    pub received_quantity: Option<i32>,
    pub damaged_quantity: Option<i32>,
    pub missing_quantity: Option<i32>,

    pub unit_cost: Decimal,
    pub unit_price: Decimal,
    pub total_cost: Decimal,
    pub total_value: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::dispatch::Entity",
        from = "Column::DispatchId",
        to = "super::dispatch::Column::Id"
    )]
    Dispatch,
    #[sea_orm(
        belongs_to = "super::product_batch::Entity",
        from = "Column::BatchId",
        to = "super::product_batch::Column::Id"
    )]
    Batch,
}

impl Related<super::dispatch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Dispatch.def()
    }
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
