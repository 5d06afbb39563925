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
pub enum DispatchStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "in_transit")]
    InTransit,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// An inter-store stock transfer. Source stock is debited when the dispatch
/// goes in transit; destination stock is credited with the received quantity
/// at delivery.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dispatches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub dispatch_number: String,

    pub source_store_id: Uuid,
    pub destination_store_id: Uuid,

    pub status: DispatchStatus,

    pub expected_delivery_date: Option<DateTime<Utc>>,
    pub actual_delivery_date: Option<DateTime<Utc>>,

    // Derived from items on every item mutation.
    pub total_items: i32,
    pub total_cost: Decimal,
    pub total_value: Decimal,

    pub notes: Option<String>,

    pub created_by: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::dispatch_item::Entity")]
    DispatchItems,
}

impl Related<super::dispatch_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DispatchItems.def()
    }
}

impl Model {
    pub fn can_be_approved(&self) -> bool {
        self.status == DispatchStatus::Pending
    }

    pub fn can_be_dispatched(&self) -> bool {
        self.status == DispatchStatus::Approved
    }

    pub fn can_be_delivered(&self) -> bool {
        self.status == DispatchStatus::InTransit
    }

    /// Cancellation is only allowed before any stock has physically moved.
    pub fn can_be_cancelled(&self) -> bool {
        matches!(
            self.status,
            DispatchStatus::Pending | DispatchStatus::Approved
        )
    }

    pub fn can_modify_items(&self) -> bool {
        self.status == DispatchStatus::Pending
    }
}

impl ActiveModelBehavior for ActiveModel {}
