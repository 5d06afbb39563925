//! Accounting integration seam. Completed sales post their cost of goods
//! sold to a ledger; the default implementation only records the posting in
//! the logs, which is enough for deployments without a bookkeeping backend.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::{
    entities::{order, order_item},
    errors::ServiceError,
};

/// Receives the COGS posting for a completed order. Implementations talk to
/// the bookkeeping system of record; failures are reported back but the
/// caller treats them as non-fatal.
#[async_trait]
pub trait CogsLedger: Send + Sync {
    async fn post_cogs(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
    ) -> Result<(), ServiceError>;
}

/// Default ledger that logs the posting instead of sending it anywhere.
#[derive(Debug, Default, Clone)]
pub struct LoggingCogsLedger;

#[async_trait]
impl CogsLedger for LoggingCogsLedger {
    async fn post_cogs(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
    ) -> Result<(), ServiceError> {
        let total_cogs: Decimal = items.iter().map(|i| i.cogs).sum();
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            %total_cogs,
            revenue = %order.total_amount,
            "COGS posted for completed order"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FulfillmentStatus, OrderStatus, OrderType, PaymentStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_order() -> order::Model {
        let now = Utc::now();
        order::Model {
            id: Uuid::new_v4(),
            order_number: "SO-20260829-000001".into(),
            customer_id: Uuid::new_v4(),
            store_id: None,
            order_type: OrderType::Ecommerce,
            status: OrderStatus::Confirmed,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: Some(FulfillmentStatus::Fulfilled),
            subtotal: dec!(24.00),
            tax_amount: dec!(0),
            discount_amount: dec!(0),
            shipping_amount: dec!(0),
            total_amount: dec!(24.00),
            paid_amount: dec!(0),
            outstanding_amount: dec!(24.00),
            notes: None,
            created_by: None,
            fulfilled_by: None,
            fulfilled_at: None,
            confirmed_at: Some(now),
            cancelled_at: None,
            order_date: now,
            created_at: now,
            updated_at: Some(now),
        }
    }

    #[tokio::test]
    async fn logging_ledger_always_accepts() {
        let ledger = LoggingCogsLedger;
        let order = sample_order();
        assert!(ledger.post_cogs(&order, &[]).await.is_ok());
    }
}
