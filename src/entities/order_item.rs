use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A line on an order. When `barcode_unit_id` is set the line tracks exactly
/// one physical unit and `quantity` must be 1; multi-quantity lines are split
/// into single-unit lines during fulfillment.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub order_id: Uuid,
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub barcode_unit_id: Option<Uuid>,

    /// Denormalized at add-time so the line survives product renames.
    pub product_name: String,

    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,

    /// Cost of goods, captured from the batch cost price and frozen;
    /// later batch cost changes do not touch it.
    pub cogs: Decimal,

    pub total_amount: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
    #[sea_orm(
        belongs_to = "super::product_batch::Entity",
        from = "Column::BatchId",
        to = "super::product_batch::Column::Id"
    )]
    Batch,
    #[sea_orm(
        belongs_to = "super::barcode_unit::Entity",
        from = "Column::BarcodeUnitId",
        to = "super::barcode_unit::Column::Id"
    )]
    BarcodeUnit,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl Related<super::barcode_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BarcodeUnit.def()
    }
}

impl Model {
    /// Line subtotal before discount and tax.
    pub fn line_subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

impl ActiveModelBehavior for ActiveModel {}
