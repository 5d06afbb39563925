use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sales channel the order was placed through.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderType {
    #[sea_orm(string_value = "counter")]
    Counter,
    #[sea_orm(string_value = "social_commerce")]
    SocialCommerce,
    #[sea_orm(string_value = "ecommerce")]
    Ecommerce,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "multi_store_assigned")]
    MultiStoreAssigned,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "partial")]
    Partial,
    #[sea_orm(string_value = "paid")]
    Paid,
}

/// Set only for deferred-fulfillment channels (social/ecommerce); counter
/// orders are fulfilled at the register and carry no fulfillment status.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "pending_fulfillment")]
    PendingFulfillment,
    #[sea_orm(string_value = "fulfilled")]
    Fulfilled,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub order_number: String,

    pub customer_id: Uuid,

    /// Null until multi-store assignment resolves the store for deferred
    /// e-commerce orders.
    pub store_id: Option<Uuid>,

    pub order_type: OrderType,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: Option<FulfillmentStatus>,

    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,

    pub notes: Option<String>,

    pub created_by: Option<Uuid>,
    pub fulfilled_by: Option<Uuid>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub order_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl Model {
    /// Deferred channels scan barcodes at the warehouse after checkout.
    pub fn needs_fulfillment(&self) -> bool {
        matches!(
            self.order_type,
            OrderType::SocialCommerce | OrderType::Ecommerce
        )
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfillment_status == Some(FulfillmentStatus::Fulfilled)
    }

    /// Items may be added, changed or removed only while the order is open
    /// and not yet fulfilled; fulfilled lines are pinned to scanned units.
    pub fn can_modify_items(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::MultiStoreAssigned
        ) && !self.is_fulfilled()
    }

    pub fn can_be_fulfilled(&self) -> bool {
        self.needs_fulfillment()
            && self.fulfillment_status == Some(FulfillmentStatus::PendingFulfillment)
            && matches!(
                self.status,
                OrderStatus::Pending | OrderStatus::MultiStoreAssigned
            )
    }
}

impl ActiveModelBehavior for ActiveModel {}
