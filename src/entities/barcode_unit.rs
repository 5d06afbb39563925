use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Location/lifecycle state of an individually tracked unit.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum UnitStatus {
    #[sea_orm(string_value = "in_warehouse")]
    InWarehouse,
    #[sea_orm(string_value = "in_shop")]
    InShop,
    #[sea_orm(string_value = "on_display")]
    OnDisplay,
    #[sea_orm(string_value = "in_transit")]
    InTransit,
    #[sea_orm(string_value = "in_shipment")]
    InShipment,
    #[sea_orm(string_value = "sold")]
    Sold,
    #[sea_orm(string_value = "disposed")]
    Disposed,
    #[sea_orm(string_value = "returned_to_vendor")]
    ReturnedToVendor,
}

/// One row per physical unit. The row is the unit of truth for "is this
/// specific item sellable": consumers must check `is_active` and
/// `is_defective` before transacting it.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "barcode_units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub barcode: String,

    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub current_store_id: Uuid,

    pub status: UnitStatus,

    /// Cleared once the unit reaches a terminal state (sold/disposed).
    pub is_active: bool,
    pub is_defective: bool,

    /// Set while the unit travels with a dispatch: links the unit to the
    /// exact dispatch item it departed under, so delivery lands the same
    /// units that left. Cleared when the unit re-enters circulation.
    pub dispatch_item_id: Option<Uuid>,

    pub location_updated_at: Option<DateTime<Utc>>,
    /// Free-form provenance of the last location change (dispatch number,
    /// sale order number).
    pub location_note: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
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
    #[sea_orm(has_one = "super::defective_unit::Entity")]
    DefectiveUnit,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl Related<super::defective_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DefectiveUnit.def()
    }
}

impl Model {
    /// Whether the unit may still be marked defective.
    pub fn can_be_marked_defective(&self) -> bool {
        self.is_active && !self.is_defective
    }

    /// Whether the unit is sellable through the normal-price path.
    pub fn is_sellable(&self) -> bool {
        self.is_active && !self.is_defective
    }
}

impl ActiveModelBehavior for ActiveModel {}
