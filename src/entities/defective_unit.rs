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
pub enum DefectStatus {
    #[sea_orm(string_value = "identified")]
    Identified,
    #[sea_orm(string_value = "inspected")]
    Inspected,
    #[sea_orm(string_value = "available_for_sale")]
    AvailableForSale,
    #[sea_orm(string_value = "sold")]
    Sold,
    #[sea_orm(string_value = "disposed")]
    Disposed,
    #[sea_orm(string_value = "returned_to_vendor")]
    ReturnedToVendor,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum DefectSeverity {
    #[sea_orm(string_value = "minor")]
    Minor,
    #[sea_orm(string_value = "moderate")]
    Moderate,
    #[sea_orm(string_value = "major")]
    Major,
    #[sea_orm(string_value = "critical")]
    Critical,
}

/// Side record keyed 1:1 to a barcode unit. Once created, the unit can never
/// be sold at normal price again; a discounted sale must clear the minimum
/// price floor.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "defective_units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub barcode_unit_id: Uuid,

    pub product_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub store_id: Uuid,

    pub status: DefectStatus,
    pub severity: DefectSeverity,

    pub defect_type: String,
    pub defect_description: Option<String>,

    pub original_price: Decimal,
    pub suggested_selling_price: Decimal,
    pub minimum_selling_price: Decimal,
    pub actual_selling_price: Option<Decimal>,

    pub sold_order_id: Option<Uuid>,

    pub identified_by: Option<Uuid>,
    pub inspected_by: Option<Uuid>,
    pub inspected_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::barcode_unit::Entity",
        from = "Column::BarcodeUnitId",
        to = "super::barcode_unit::Column::Id"
    )]
    BarcodeUnit,
}

impl Related<super::barcode_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BarcodeUnit.def()
    }
}

impl Model {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            DefectStatus::Sold | DefectStatus::Disposed | DefectStatus::ReturnedToVendor
        )
    }

    pub fn can_be_sold(&self) -> bool {
        self.status == DefectStatus::AvailableForSale
    }
}

impl ActiveModelBehavior for ActiveModel {}
