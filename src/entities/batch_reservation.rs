use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ReservationStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "released")]
    Released,
    #[sea_orm(string_value = "consumed")]
    Consumed,
}

/// Holds batch quantity for a dispatch item during the pending/approved
/// window, so two dispatches cannot both pass an availability check against
/// the same batch. Released on cancel or item removal, consumed by the stock
/// debit when the dispatch goes in transit.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batch_reservations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub batch_id: Uuid,
    pub dispatch_item_id: Uuid,

    pub quantity: i32,
    pub status: ReservationStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product_batch::Entity",
        from = "Column::BatchId",
        to = "super::product_batch::Column::Id"
    )]
    Batch,
    #[sea_orm(
        belongs_to = "super::dispatch_item::Entity",
        from = "Column::DispatchItemId",
        to = "super::dispatch_item::Column::Id"
    )]
    DispatchItem,
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl Related<super::dispatch_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DispatchItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
