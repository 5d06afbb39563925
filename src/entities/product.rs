use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    #[sea_orm(unique)]
    pub sku: String,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_batch::Entity")]
    ProductBatches,
    #[sea_orm(has_many = "super::barcode_unit::Entity")]
    BarcodeUnits,
}

impl Related<super::product_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProductBatches.def()
    }
}

impl Related<super::barcode_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BarcodeUnits.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
