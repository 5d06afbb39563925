//! Order aggregate: creation, item mutation, multi-store assignment,
//! warehouse fulfillment (barcode scan) and completion. Every operation runs
//! in a single transaction; batch rows are locked before their quantity is
//! read so concurrent orders cannot overdraw stock.

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::{
        barcode_unit,
        customer::{self, Entity as Customer},
        order::{self, Entity as Order},
        order_item::{self, Entity as OrderItem},
        product::Entity as Product,
        product_batch::{self, Entity as ProductBatch},
        FulfillmentStatus, MovementType, OrderStatus, OrderType, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounting::CogsLedger,
        barcodes,
        stock_ledger::{self, Movement},
    },
};

const WALK_IN_PHONE: &str = "WALK-IN";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CustomerDetails {
    #[validate(length(min = 1, message = "Customer name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Customer phone is required"))]
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderItemRequest {
    pub product_id: Uuid,
    pub batch_id: Uuid,
    /// Optional scan of the specific unit being sold.
    pub barcode: Option<String>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount_amount: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub order_type: OrderType,
    pub customer_id: Option<Uuid>,
    pub customer: Option<CustomerDetails>,
    /// Required for counter orders; deferred e-commerce orders may leave it
    /// unset until multi-store assignment.
    pub store_id: Option<Uuid>,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<CreateOrderItemRequest>,
    pub discount_amount: Option<Decimal>,
    pub shipping_amount: Option<Decimal>,
    pub notes: Option<String>,
    /// Who is placing the order (salesman or system actor).
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: Option<i32>,
    pub unit_price: Option<Decimal>,
    pub discount_amount: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFulfillment {
    pub order_item_id: Uuid,
    pub barcodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStoreAssignment {
    pub order_item_id: Uuid,
    pub store_id: Uuid,
}

/// An order with its line items, as returned by every mutating operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    cogs_ledger: Arc<dyn CogsLedger>,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, cogs_ledger: Arc<dyn CogsLedger>) -> Self {
        Self {
            db,
            event_sender,
            cogs_ledger,
        }
    }

    /// Creates an order with its initial items. Counter orders are tied to a
    /// store and fulfilled at the register; social/e-commerce orders defer
    /// fulfillment to a later barcode scan at the warehouse.
    #[instrument(skip(self, request), fields(order_type = %request.order_type))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithItems, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }

        if request.order_type == OrderType::Counter && request.store_id.is_none() {
            return Err(ServiceError::ValidationError(
                "Counter orders require a store".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();

        let customer = resolve_customer(&txn, &request).await?;

        // Counter orders are fulfilled at the register; deferred channels wait
        // for the warehouse scan.
        let fulfillment_status = if request.order_type == OrderType::Counter {
            None
        } else {
            Some(FulfillmentStatus::PendingFulfillment)
        };

        let order_id = Uuid::new_v4();
        let order_number = generate_order_number(&txn).await?;
        let discount = request.discount_amount.unwrap_or_default();
        let shipping = request.shipping_amount.unwrap_or_default();

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(customer.id),
            store_id: Set(request.store_id),
            order_type: Set(request.order_type),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            fulfillment_status: Set(fulfillment_status),
            subtotal: Set(Decimal::ZERO),
            tax_amount: Set(Decimal::ZERO),
            discount_amount: Set(discount),
            shipping_amount: Set(shipping),
            total_amount: Set(Decimal::ZERO),
            paid_amount: Set(Decimal::ZERO),
            outstanding_amount: Set(Decimal::ZERO),
            notes: Set(request.notes.clone()),
            created_by: Set(request.created_by),
            fulfilled_by: Set(None),
            fulfilled_at: Set(None),
            confirmed_at: Set(None),
            cancelled_at: Set(None),
            order_date: Set(now),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        for item in &request.items {
            let product = Product::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;

            let batch = stock_ledger::lock_batch(&txn, item.batch_id).await?;
            if batch.product_id != product.id {
                return Err(ServiceError::ValidationError(format!(
                    "Batch {} does not belong to product {}",
                    batch.batch_number, product.name
                )));
            }
            if let Some(store_id) = request.store_id {
                if batch.store_id != store_id {
                    return Err(ServiceError::ValidationError(format!(
                        "Batch {} is not available at this store",
                        batch.batch_number
                    )));
                }
            }

            let available = stock_ledger::available_quantity(&txn, &batch).await?;
            if available < item.quantity {
                return Err(ServiceError::InsufficientStock {
                    batch_id: batch.id,
                    requested: item.quantity,
                    available,
                });
            }

            let mut barcode_unit_id = None;
            if let Some(code) = &item.barcode {
                let (unit, _) = barcodes::validate_unit_for_sale(
                    &txn,
                    code,
                    product.id,
                    batch.id,
                    request.store_id,
                )
                .await?;
                ensure_unit_unclaimed(&txn, &unit).await?;
                if item.quantity != 1 {
                    return Err(ServiceError::ValidationError(format!(
                        "Barcode {} identifies a single unit; quantity must be 1",
                        code
                    )));
                }
                barcode_unit_id = Some(unit.id);
            }

            let item_discount = item.discount_amount.unwrap_or_default();
            let item_tax = item.tax_amount.unwrap_or_default();
            let line_subtotal = item.unit_price * Decimal::from(item.quantity);
            let cogs = (batch.cost_price * Decimal::from(item.quantity)).round_dp(2);

            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(product.id),
                batch_id: Set(batch.id),
                barcode_unit_id: Set(barcode_unit_id),
                product_name: Set(product.name.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                discount_amount: Set(item_discount),
                tax_amount: Set(item_tax),
                cogs: Set(cogs),
                total_amount: Set((line_subtotal - item_discount + item_tax).round_dp(2)),
                created_at: Set(now),
                updated_at: Set(Some(now)),
            }
            .insert(&txn)
            .await?;
        }

        let order = recalculate_totals(&txn, order).await?;
        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        info!(order_id = %order.id, order_number = %order.order_number, "Order created");
        self.event_sender.send_or_log(Event::OrderCreated(order.id)).await;

        Ok(OrderWithItems { order, items })
    }

    /// Adds scanned units to an open order. One barcode always becomes one
    /// single-quantity line item.
    #[instrument(skip(self, codes), fields(count = codes.len()))]
    pub async fn add_items_by_barcode(
        &self,
        order_id: Uuid,
        codes: Vec<String>,
        _actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        if codes.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one barcode is required".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if !order.can_modify_items() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Items cannot be added to a {} order",
                order.status
            )));
        }
        let store_id = order.store_id.ok_or_else(|| {
            ServiceError::ValidationError(
                "Order has no store assigned; assign stores before scanning items".into(),
            )
        })?;

        let now = Utc::now();
        for code in &codes {
            let unit = barcodes::find_unit(&txn, code).await?;
            let (unit, batch) = barcodes::validate_unit_for_sale(
                &txn,
                code,
                unit.product_id,
                unit.batch_id,
                Some(store_id),
            )
            .await?;
            ensure_unit_unclaimed(&txn, &unit).await?;

            let batch = stock_ledger::lock_batch(&txn, batch.id).await?;
            let available = stock_ledger::available_quantity(&txn, &batch).await?;
            if available < 1 {
                return Err(ServiceError::InsufficientStock {
                    batch_id: batch.id,
                    requested: 1,
                    available,
                });
            }

            let product = Product::find_by_id(unit.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", unit.product_id))
                })?;

            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(unit.product_id),
                batch_id: Set(batch.id),
                barcode_unit_id: Set(Some(unit.id)),
                product_name: Set(product.name),
                quantity: Set(1),
                unit_price: Set(batch.sell_price),
                discount_amount: Set(Decimal::ZERO),
                tax_amount: Set(Decimal::ZERO),
                cogs: Set(batch.cost_price.round_dp(2)),
                total_amount: Set(batch.sell_price),
                created_at: Set(now),
                updated_at: Set(Some(now)),
            }
            .insert(&txn)
            .await?;
        }

        let order = recalculate_totals(&txn, order).await?;
        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderItemsChanged(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Updates quantity/pricing on a line item; quantity increases re-check
    /// live batch availability.
    #[instrument(skip(self, request))]
    pub async fn update_item(
        &self,
        order_id: Uuid,
        item_id: Uuid,
        request: UpdateItemRequest,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if !order.can_modify_items() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Items cannot be changed on a {} order",
                order.status
            )));
        }

        let item = find_item(&txn, order.id, item_id).await?;

        let quantity = request.quantity.unwrap_or(item.quantity);
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".into(),
            ));
        }
        if item.barcode_unit_id.is_some() && quantity != 1 {
            return Err(ServiceError::ValidationError(
                "Barcode-tracked items are fixed at quantity 1".into(),
            ));
        }

        let batch = stock_ledger::lock_batch(&txn, item.batch_id).await?;
        let available = stock_ledger::available_quantity(&txn, &batch).await?;
        if available < quantity {
            return Err(ServiceError::InsufficientStock {
                batch_id: batch.id,
                requested: quantity,
                available,
            });
        }

        let unit_price = request.unit_price.unwrap_or(item.unit_price);
        let discount = request.discount_amount.unwrap_or(item.discount_amount);
        let tax = request.tax_amount.unwrap_or(item.tax_amount);
        let line_subtotal = unit_price * Decimal::from(quantity);

        let mut active: order_item::ActiveModel = item.into();
        active.quantity = Set(quantity);
        active.unit_price = Set(unit_price);
        active.discount_amount = Set(discount);
        active.tax_amount = Set(tax);
        active.cogs = Set((batch.cost_price * Decimal::from(quantity)).round_dp(2));
        active.total_amount = Set((line_subtotal - discount + tax).round_dp(2));
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await?;

        let order = recalculate_totals(&txn, order).await?;
        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderItemsChanged(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Removes a line item from an open order.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        order_id: Uuid,
        item_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if !order.can_modify_items() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Items cannot be removed from a {} order",
                order.status
            )));
        }

        let item = find_item(&txn, order.id, item_id).await?;
        item.delete(&txn).await?;

        let order = recalculate_totals(&txn, order).await?;
        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::OrderItemsChanged(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Resolves unassigned items of a deferred order to stores with
    /// sufficient stock, re-pointing each item at a batch of the chosen
    /// store. All-or-nothing: if any item cannot be placed, nothing changes.
    #[instrument(skip(self, assignments))]
    pub async fn assign_stores(
        &self,
        order_id: Uuid,
        assignments: Option<Vec<ItemStoreAssignment>>,
        _actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;

        if order.store_id.is_some() {
            return Err(ServiceError::InvalidStateTransition(
                "Order is already assigned to a single store".into(),
            ));
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Stores can only be assigned to pending orders, not {}",
                order.status
            )));
        }

        let manual: HashMap<Uuid, Uuid> = assignments
            .unwrap_or_default()
            .into_iter()
            .map(|a| (a.order_item_id, a.store_id))
            .collect();

        let items = load_items(&txn, order.id).await?;
        let now = Utc::now();

        for item in items {
            let batch = match manual.get(&item.id) {
                Some(&store_id) => {
                    best_batch_for(&txn, item.product_id, item.quantity, Some(store_id))
                        .await?
                        .ok_or_else(|| ServiceError::InsufficientStock {
                            batch_id: item.batch_id,
                            requested: item.quantity,
                            available: 0,
                        })?
                }
                None => best_batch_for(&txn, item.product_id, item.quantity, None)
                    .await?
                    .ok_or_else(|| ServiceError::InsufficientStock {
                        batch_id: item.batch_id,
                        requested: item.quantity,
                        available: 0,
                    })?,
            };

            let quantity = item.quantity;
            let mut active: order_item::ActiveModel = item.into();
            active.batch_id = Set(batch.id);
            active.cogs = Set((batch.cost_price * Decimal::from(quantity)).round_dp(2));
            active.updated_at = Set(Some(now));
            active.update(&txn).await?;
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::MultiStoreAssigned);
        active.fulfillment_status = Set(Some(FulfillmentStatus::PendingFulfillment));
        active.updated_at = Set(Some(now));
        let order = active.update(&txn).await?;

        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        info!(order_id = %order.id, "Order items assigned to stores");
        self.event_sender.send_or_log(Event::OrderStoresAssigned(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Fulfills a deferred order by mapping each item to scanned barcodes.
    /// Multi-quantity items are split into single-unit lines; per-unit
    /// discount/tax/cogs shares are rounded and the last unit absorbs the
    /// remainder so the original totals reconcile exactly.
    #[instrument(skip(self, fulfillments))]
    pub async fn fulfill(
        &self,
        order_id: Uuid,
        fulfillments: Vec<ItemFulfillment>,
        actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        if fulfillments.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one fulfillment entry is required".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;

        if !order.needs_fulfillment() {
            return Err(ServiceError::InvalidStateTransition(
                "Counter orders are fulfilled at the register and do not require fulfillment"
                    .into(),
            ));
        }
        if !order.can_be_fulfilled() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Order cannot be fulfilled. Status: {}, fulfillment status: {}",
                order.status,
                order
                    .fulfillment_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".into())
            )));
        }

        let mut seen_codes = HashSet::new();
        for fulfillment in &fulfillments {
            for code in &fulfillment.barcodes {
                if !seen_codes.insert(code.clone()) {
                    return Err(ServiceError::InvalidBarcode {
                        barcode: code.clone(),
                        reason: "scanned more than once in this fulfillment".into(),
                    });
                }
            }
        }

        let now = Utc::now();
        for fulfillment in &fulfillments {
            let item = find_item(&txn, order.id, fulfillment.order_item_id).await?;

            if fulfillment.barcodes.len() != item.quantity as usize {
                return Err(ServiceError::ValidationError(format!(
                    "Item '{}' requires {} barcode(s), but {} provided",
                    item.product_name,
                    item.quantity,
                    fulfillment.barcodes.len()
                )));
            }

            let mut units = Vec::with_capacity(fulfillment.barcodes.len());
            for code in &fulfillment.barcodes {
                let (unit, _) = barcodes::validate_unit_for_sale(
                    &txn,
                    code,
                    item.product_id,
                    item.batch_id,
                    order.store_id,
                )
                .await?;
                ensure_unit_unclaimed(&txn, &unit).await?;
                units.push(unit);
            }

            if item.quantity == 1 {
                let mut active: order_item::ActiveModel = item.into();
                active.barcode_unit_id = Set(Some(units[0].id));
                active.updated_at = Set(Some(now));
                active.update(&txn).await?;
            } else {
                split_item_across_units(&txn, item, &units, now).await?;
            }
        }

        let mut active: order::ActiveModel = order.into();
        active.fulfillment_status = Set(Some(FulfillmentStatus::Fulfilled));
        active.fulfilled_by = Set(actor);
        active.fulfilled_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let order = active.update(&txn).await?;

        let order = recalculate_totals(&txn, order).await?;
        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        info!(order_id = %order.id, "Order fulfilled");
        self.event_sender.send_or_log(Event::OrderFulfilled(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Completes a pending order: debits stock for every line, marks scanned
    /// units sold, freezes COGS and records the customer's purchase. COGS
    /// ledger posting failure is logged but does not fail the completion.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        order_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;

        if !matches!(
            order.status,
            OrderStatus::Pending | OrderStatus::MultiStoreAssigned
        ) {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only open orders can be completed, not {}",
                order.status
            )));
        }
        if order.needs_fulfillment() && !order.is_fulfilled() {
            return Err(ServiceError::FulfillmentRequired(order.id));
        }

        let items = load_items(&txn, order.id).await?;
        let mut sold_units = Vec::new();
        let mut adjustments = Vec::new();

        for item in &items {
            let batch = stock_ledger::lock_batch(&txn, item.batch_id).await?;
            let available = stock_ledger::available_quantity(&txn, &batch).await?;
            if available < item.quantity {
                return Err(ServiceError::InsufficientStock {
                    batch_id: batch.id,
                    requested: item.quantity,
                    available,
                });
            }

            if let Some(unit_id) = item.barcode_unit_id {
                let unit = barcode_unit::Entity::find_by_id(unit_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Barcode unit {} not found", unit_id))
                    })?;
                if !unit.is_active {
                    return Err(ServiceError::InvalidBarcode {
                        barcode: unit.barcode.clone(),
                        reason: "is no longer active".into(),
                    });
                }
                if unit.is_defective {
                    return Err(ServiceError::InvalidBarcode {
                        barcode: unit.barcode.clone(),
                        reason: "was marked defective while on this order; remove the line or sell it at the discounted price".into(),
                    });
                }
                let sold = barcodes::mark_sold(&txn, unit, &order.order_number, actor).await?;
                sold_units.push(sold.id);
            }

            // COGS re-confirmed against the batch cost at completion time.
            let cogs = (batch.cost_price * Decimal::from(item.quantity)).round_dp(2);
            let mut active: order_item::ActiveModel = item.clone().into();
            active.cogs = Set(cogs);
            active.updated_at = Set(Some(Utc::now()));
            active.update(&txn).await?;

            let updated = stock_ledger::remove_stock(
                &txn,
                item.batch_id,
                item.quantity,
                Movement::new(MovementType::Sale)
                    .reference("order", order.id)
                    .note(format!("Sold via order {}", order.order_number))
                    .actor(actor),
            )
            .await?;
            adjustments.push((updated.id, item.quantity, updated.quantity));
        }

        let now = Utc::now();
        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(OrderStatus::Confirmed);
        active.confirmed_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let order = active.update(&txn).await?;

        record_customer_purchase(&txn, &order).await?;

        // Ledger posting failure is deliberately non-fatal: the sale stands
        // and the posting is corrected manually.
        let items = load_items(&txn, order.id).await?;
        if let Err(e) = self.cogs_ledger.post_cogs(&order, &items).await {
            error!(order_id = %order.id, error = %e, "Failed to post COGS to the accounting ledger");
        }

        txn.commit().await?;

        info!(order_id = %order.id, order_number = %order.order_number, "Order completed");
        self.event_sender.send_or_log(Event::OrderCompleted(order.id)).await;
        for (batch_id, quantity, new_on_hand) in adjustments {
            self.event_sender
                .send_or_log(Event::StockAdjusted {
                    batch_id,
                    movement_type: MovementType::Sale,
                    quantity: -quantity,
                    new_on_hand,
                })
                .await;
        }
        for unit_id in sold_units {
            self.event_sender
                .send_or_log(Event::UnitSold {
                    barcode_unit_id: unit_id,
                    order_id: order.id,
                })
                .await;
        }

        Ok(OrderWithItems { order, items })
    }

    /// Cancels a not-yet-completed order. Completed orders go through the
    /// returns flow instead; stock was never debited for open orders, so no
    /// restock happens here.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        reason: Option<String>,
        _actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_order(&txn, order_id).await?;

        match order.status {
            OrderStatus::Confirmed => {
                return Err(ServiceError::InvalidStateTransition(
                    "Completed orders cannot be cancelled; use the returns flow".into(),
                ));
            }
            OrderStatus::Cancelled => {
                return Err(ServiceError::InvalidStateTransition(
                    "Order is already cancelled".into(),
                ));
            }
            _ => {}
        }

        let now = Utc::now();
        let note = format!(
            "Cancelled: {}",
            reason.as_deref().unwrap_or("No reason provided")
        );
        let notes = match &order.notes {
            Some(existing) => format!("{}\n{}", existing, note),
            None => note,
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled);
        active.cancelled_at = Set(Some(now));
        active.notes = Set(Some(notes));
        active.updated_at = Set(Some(now));
        let order = active.update(&txn).await?;

        let items = load_items(&txn, order.id).await?;
        txn.commit().await?;

        info!(order_id = %order.id, "Order cancelled");
        self.event_sender.send_or_log(Event::OrderCancelled(order.id)).await;
        Ok(OrderWithItems { order, items })
    }

    /// Retrieves an order with its items.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let db = &*self.db;
        let order = find_order(db, order_id).await?;
        let items = load_items(db, order.id).await?;
        Ok(OrderWithItems { order, items })
    }

    /// Lists orders with pagination, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let db = &*self.db;
        let paginator = Order::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }
}

async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    Order::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

async fn find_item<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    item_id: Uuid,
) -> Result<order_item::Model, ServiceError> {
    OrderItem::find_by_id(item_id)
        .filter(order_item::Column::OrderId.eq(order_id))
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Order item {} not found in this order", item_id))
        })
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    Ok(OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// A barcode can back at most one line item of a non-cancelled order. Also
/// used by the defective workflow: a claimed unit cannot be pulled out from
/// under an open order.
pub(crate) async fn ensure_unit_unclaimed<C: ConnectionTrait>(
    conn: &C,
    unit: &barcode_unit::Model,
) -> Result<(), ServiceError> {
    let claims = OrderItem::find()
        .filter(order_item::Column::BarcodeUnitId.eq(unit.id))
        .all(conn)
        .await?;
    for claim in claims {
        if let Some(order) = Order::find_by_id(claim.order_id).one(conn).await? {
            if order.status != OrderStatus::Cancelled {
                return Err(ServiceError::InvalidBarcode {
                    barcode: unit.barcode.clone(),
                    reason: format!("already assigned to order {}", order.order_number),
                });
            }
        }
    }
    Ok(())
}

/// Recomputes the order totals from its items. The stored identity is
/// `total = subtotal + tax - discount + shipping`, where `subtotal` is net of
/// item-level discounts and `discount` is the order-level discount.
async fn recalculate_totals<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<order::Model, ServiceError> {
    let items = load_items(conn, order.id).await?;

    let subtotal: Decimal = items
        .iter()
        .map(|i| i.line_subtotal() - i.discount_amount)
        .sum();
    let tax: Decimal = items.iter().map(|i| i.tax_amount).sum();
    let total = (subtotal + tax - order.discount_amount + order.shipping_amount).round_dp(2);
    let outstanding = total - order.paid_amount;

    let mut active: order::ActiveModel = order.into();
    active.subtotal = Set(subtotal.round_dp(2));
    active.tax_amount = Set(tax.round_dp(2));
    active.total_amount = Set(total);
    active.outstanding_amount = Set(outstanding);
    active.updated_at = Set(Some(Utc::now()));
    Ok(active.update(conn).await?)
}

/// Splits a multi-quantity item into single-unit lines, one per scanned
/// barcode. The first N-1 units carry the rounded share of discount/tax/cogs;
/// the last unit takes the remainder.
async fn split_item_across_units<C: ConnectionTrait>(
    conn: &C,
    item: order_item::Model,
    units: &[barcode_unit::Model],
    now: chrono::DateTime<Utc>,
) -> Result<(), ServiceError> {
    let quantity = Decimal::from(item.quantity);
    let count = units.len();

    let discount_share = (item.discount_amount / quantity).round_dp(2);
    let tax_share = (item.tax_amount / quantity).round_dp(2);
    let cogs_share = (item.cogs / quantity).round_dp(2);

    let last_discount = item.discount_amount - discount_share * Decimal::from(count as i64 - 1);
    let last_tax = item.tax_amount - tax_share * Decimal::from(count as i64 - 1);
    let last_cogs = item.cogs - cogs_share * Decimal::from(count as i64 - 1);

    let order_id = item.order_id;
    let product_id = item.product_id;
    let batch_id = item.batch_id;
    let product_name = item.product_name.clone();
    let unit_price = item.unit_price;

    // The original line shrinks to the first unit.
    let mut active: order_item::ActiveModel = item.into();
    active.quantity = Set(1);
    active.barcode_unit_id = Set(Some(units[0].id));
    active.discount_amount = Set(discount_share);
    active.tax_amount = Set(tax_share);
    active.cogs = Set(cogs_share);
    active.total_amount = Set((unit_price - discount_share + tax_share).round_dp(2));
    active.updated_at = Set(Some(now));
    active.update(conn).await?;

    for (idx, unit) in units.iter().enumerate().skip(1) {
        let is_last = idx == count - 1;
        let (discount, tax, cogs) = if is_last {
            (last_discount, last_tax, last_cogs)
        } else {
            (discount_share, tax_share, cogs_share)
        };

        order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product_id),
            batch_id: Set(batch_id),
            barcode_unit_id: Set(Some(unit.id)),
            product_name: Set(product_name.clone()),
            quantity: Set(1),
            unit_price: Set(unit_price),
            discount_amount: Set(discount),
            tax_amount: Set(tax),
            cogs: Set(cogs),
            total_amount: Set((unit_price - discount + tax).round_dp(2)),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(conn)
        .await?;
    }

    Ok(())
}

/// Finds the batch best able to satisfy `quantity` of a product, preferring
/// the largest availability; restricted to one store when given.
async fn best_batch_for<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
    store_id: Option<Uuid>,
) -> Result<Option<product_batch::Model>, ServiceError> {
    let mut query = ProductBatch::find()
        .filter(product_batch::Column::ProductId.eq(product_id))
        .filter(product_batch::Column::IsActive.eq(true));
    if let Some(store_id) = store_id {
        query = query.filter(product_batch::Column::StoreId.eq(store_id));
    }
    let batches = query.all(conn).await?;

    let mut best: Option<(i32, product_batch::Model)> = None;
    for batch in batches {
        let available = stock_ledger::available_quantity(conn, &batch).await?;
        if available >= quantity {
            match &best {
                Some((best_available, _)) if *best_available >= available => {}
                _ => best = Some((available, batch)),
            }
        }
    }
    Ok(best.map(|(_, batch)| batch))
}

async fn resolve_customer<C: ConnectionTrait>(
    conn: &C,
    request: &CreateOrderRequest,
) -> Result<customer::Model, ServiceError> {
    if let Some(customer_id) = request.customer_id {
        return Customer::find_by_id(customer_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", customer_id))
            });
    }

    if let Some(details) = &request.customer {
        details.validate()?;
        if let Some(existing) = Customer::find()
            .filter(customer::Column::Phone.eq(details.phone.as_str()))
            .one(conn)
            .await?
        {
            return Ok(existing);
        }
        return create_customer(
            conn,
            &details.name,
            &details.phone,
            details.email.clone(),
            request.order_type,
        )
        .await;
    }

    // Walk-in fallback applies to counter sales only.
    if request.order_type != OrderType::Counter {
        return Err(ServiceError::ValidationError(format!(
            "Customer information is required for {} orders",
            request.order_type
        )));
    }
    if let Some(walk_in) = Customer::find()
        .filter(customer::Column::Phone.eq(WALK_IN_PHONE))
        .one(conn)
        .await?
    {
        return Ok(walk_in);
    }
    create_customer(conn, "Walk-in Customer", WALK_IN_PHONE, None, OrderType::Counter).await
}

async fn create_customer<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    phone: &str,
    email: Option<String>,
    order_type: OrderType,
) -> Result<customer::Model, ServiceError> {
    let now = Utc::now();
    Ok(customer::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        phone: Set(phone.to_string()),
        email: Set(email),
        customer_type: Set(order_type.to_string()),
        is_active: Set(true),
        total_purchases: Set(Decimal::ZERO),
        purchase_count: Set(0),
        last_purchase_at: Set(None),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(conn)
    .await?)
}

async fn record_customer_purchase<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
) -> Result<(), ServiceError> {
    let customer = Customer::find_by_id(order.customer_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Customer {} not found", order.customer_id))
        })?;

    let total_purchases = customer.total_purchases + order.total_amount;
    let purchase_count = customer.purchase_count + 1;

    let mut active: customer::ActiveModel = customer.into();
    active.total_purchases = Set(total_purchases);
    active.purchase_count = Set(purchase_count);
    active.last_purchase_at = Set(Some(Utc::now()));
    active.updated_at = Set(Some(Utc::now()));
    active.update(conn).await?;
    Ok(())
}

/// Generates an order number of the form `SO-YYYYMMDD-XXXXXX`.
async fn generate_order_number<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..10 {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        let candidate = format!("SO-{}-{:06}", Utc::now().format("%Y%m%d"), suffix);
        let exists = Order::find()
            .filter(order::Column::OrderNumber.eq(candidate.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !exists {
            return Ok(candidate);
        }
    }
    Err(ServiceError::InternalError(
        "Failed to generate a unique order number".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item_with(
        quantity: i32,
        unit_price: Decimal,
        discount: Decimal,
        tax: Decimal,
        cogs: Decimal,
    ) -> order_item::Model {
        let now = Utc::now();
        order_item::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            barcode_unit_id: None,
            product_name: "Test product".into(),
            quantity,
            unit_price,
            discount_amount: discount,
            tax_amount: tax,
            cogs,
            total_amount: unit_price * Decimal::from(quantity) - discount + tax,
            created_at: now,
            updated_at: Some(now),
        }
    }

    #[test]
    fn split_shares_reconcile_exactly() {
        // 3-way split of 10.00 leaves the last unit absorbing the cent.
        let item = item_with(3, dec!(50.00), dec!(10.00), dec!(0.00), dec!(100.00));
        let qty = Decimal::from(item.quantity);
        let share = (item.discount_amount / qty).round_dp(2);
        let last = item.discount_amount - share * Decimal::from(2);
        assert_eq!(share, dec!(3.33));
        assert_eq!(last, dec!(3.34));
        assert_eq!(share + share + last, item.discount_amount);

        let cogs_share = (item.cogs / qty).round_dp(2);
        let cogs_last = item.cogs - cogs_share * Decimal::from(2);
        assert_eq!(cogs_share * Decimal::from(2) + cogs_last, item.cogs);
    }

    #[test]
    fn line_subtotal_multiplies_price_by_quantity() {
        let item = item_with(3, dec!(8.00), dec!(0), dec!(0), dec!(15.00));
        assert_eq!(item.line_subtotal(), dec!(24.00));
    }
}
