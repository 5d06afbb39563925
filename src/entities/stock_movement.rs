use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum MovementType {
    #[sea_orm(string_value = "receipt")]
    Receipt,
    #[sea_orm(string_value = "sale")]
    Sale,
    #[sea_orm(string_value = "restock")]
    Restock,
    #[sea_orm(string_value = "transfer_out")]
    TransferOut,
    #[sea_orm(string_value = "transfer_in")]
    TransferIn,
    #[sea_orm(string_value = "damaged")]
    Damaged,
    #[sea_orm(string_value = "missing")]
    Missing,
    #[sea_orm(string_value = "defective")]
    Defective,
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
}

/// Append-only ledger row written alongside every batch quantity mutation.
/// Structured replacement for free-form audit blobs: each row names the
/// entity, the signed quantity, the actor and the triggering reference.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub batch_id: Uuid,
    pub store_id: Uuid,

    pub movement_type: MovementType,

    /// Signed: negative for debits, positive for credits.
    pub quantity: i32,

    pub unit_cost: Option<Decimal>,

    /// What caused the movement, e.g. ("order", order id) or
    /// ("dispatch", dispatch id).
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,

    pub note: Option<String>,
    pub actor_id: Option<Uuid>,

    pub occurred_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product_batch::Entity",
        from = "Column::BatchId",
        to = "super::product_batch::Column::Id"
    )]
    Batch,
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
