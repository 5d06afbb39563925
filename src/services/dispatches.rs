//! Inter-store transfers. A dispatch walks pending → approved → in_transit →
//! delivered; item rows reserve batch stock for the pending/approved window,
//! the source is debited when the goods depart and the destination is
//! credited with what actually arrives. Damaged and missing units are written
//! off on delivery, never silently added to destination stock.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::{
        barcode_unit::{self, Entity as BarcodeUnit},
        batch_reservation::{self, Entity as BatchReservation},
        dispatch::{self, Entity as Dispatch},
        dispatch_item::{self, Entity as DispatchItem},
        product_batch,
        store::Entity as Store,
        DispatchStatus, MovementType, ReservationStatus, UnitStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock_ledger::{self, Movement},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchItemRequest {
    pub batch_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDispatchRequest {
    pub source_store_id: Uuid,
    pub destination_store_id: Uuid,
    pub expected_delivery_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<DispatchItemRequest>,
}

/// Per-item receipt counts reported on delivery. Unspecified counts default
/// to a full, healthy receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryItemReport {
    pub dispatch_item_id: Uuid,
    pub received_quantity: Option<i32>,
    pub damaged_quantity: Option<i32>,
    pub missing_quantity: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchWithItems {
    pub dispatch: dispatch::Model,
    pub items: Vec<dispatch_item::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchListResponse {
    pub dispatches: Vec<dispatch::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Clone)]
pub struct DispatchService {
    db: Arc<DbPool>,
    event_sender: EventSender,
}

impl DispatchService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates a pending dispatch with its initial items, reserving batch
    /// stock for each one.
    #[instrument(skip(self, request), fields(source = %request.source_store_id, destination = %request.destination_store_id))]
    pub async fn create_dispatch(
        &self,
        request: CreateDispatchRequest,
    ) -> Result<DispatchWithItems, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }
        if request.source_store_id == request.destination_store_id {
            return Err(ServiceError::ValidationError(
                "Source and destination stores must differ".into(),
            ));
        }

        let txn = self.db.begin().await?;

        for store_id in [request.source_store_id, request.destination_store_id] {
            Store::find_by_id(store_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;
        }

        let now = Utc::now();
        let dispatch = dispatch::ActiveModel {
            id: Set(Uuid::new_v4()),
            dispatch_number: Set(generate_dispatch_number(&txn).await?),
            source_store_id: Set(request.source_store_id),
            destination_store_id: Set(request.destination_store_id),
            status: Set(DispatchStatus::Pending),
            expected_delivery_date: Set(request.expected_delivery_date),
            actual_delivery_date: Set(None),
            total_items: Set(0),
            total_cost: Set(Decimal::ZERO),
            total_value: Set(Decimal::ZERO),
            notes: Set(request.notes.clone()),
            created_by: Set(request.created_by),
            approved_by: Set(None),
            approved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        for item in &request.items {
            insert_item(&txn, &dispatch, item.batch_id, item.quantity).await?;
        }

        let dispatch = recalculate_totals(&txn, dispatch).await?;
        let items = load_items(&txn, dispatch.id).await?;
        txn.commit().await?;

        info!(dispatch_id = %dispatch.id, dispatch_number = %dispatch.dispatch_number, "Dispatch created");
        self.event_sender.send_or_log(Event::DispatchCreated(dispatch.id)).await;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Adds an item to a pending dispatch, reserving its stock.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        dispatch_id: Uuid,
        request: DispatchItemRequest,
    ) -> Result<DispatchWithItems, ServiceError> {
        request.validate()?;

        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_modify_items() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Items can only be changed on pending dispatches, not {}",
                dispatch.status
            )));
        }

        insert_item(&txn, &dispatch, request.batch_id, request.quantity).await?;

        let dispatch = recalculate_totals(&txn, dispatch).await?;
        let items = load_items(&txn, dispatch.id).await?;
        txn.commit().await?;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Removes an item from a pending dispatch and releases its reservation.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        dispatch_id: Uuid,
        item_id: Uuid,
    ) -> Result<DispatchWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_modify_items() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Items can only be changed on pending dispatches, not {}",
                dispatch.status
            )));
        }

        let item = find_item(&txn, dispatch.id, item_id).await?;
        close_reservations(&txn, item.id, ReservationStatus::Released).await?;
        item.delete(&txn).await?;

        let dispatch = recalculate_totals(&txn, dispatch).await?;
        let items = load_items(&txn, dispatch.id).await?;
        txn.commit().await?;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Approves a pending dispatch. Requires at least one item; the stock
    /// guarantee is carried by the reservations already in place.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        dispatch_id: Uuid,
        approver: Option<Uuid>,
    ) -> Result<DispatchWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_be_approved() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only pending dispatches can be approved, not {}",
                dispatch.status
            )));
        }

        let items = load_items(&txn, dispatch.id).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Dispatch has no items to approve".into(),
            ));
        }

        let now = Utc::now();
        let mut active: dispatch::ActiveModel = dispatch.into();
        active.status = Set(DispatchStatus::Approved);
        active.approved_by = Set(approver);
        active.approved_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let dispatch = active.update(&txn).await?;
        txn.commit().await?;

        info!(dispatch_id = %dispatch.id, "Dispatch approved");
        self.event_sender.send_or_log(Event::DispatchApproved(dispatch.id)).await;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Marks an approved dispatch in transit: consumes the reservations,
    /// debits source stock once, and moves the batch's scanned units onto the
    /// truck.
    #[instrument(skip(self))]
    pub async fn mark_dispatched(
        &self,
        dispatch_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<DispatchWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_be_dispatched() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only approved dispatches can be marked in transit, not {}",
                dispatch.status
            )));
        }

        let items = load_items(&txn, dispatch.id).await?;
        let mut adjustments = Vec::new();
        for item in &items {
            // Consuming before debiting frees the reservation so the removal
            // sees the quantity it holds.
            close_reservations(&txn, item.id, ReservationStatus::Consumed).await?;
            let updated = stock_ledger::remove_stock(
                &txn,
                item.batch_id,
                item.quantity,
                Movement::new(MovementType::TransferOut)
                    .reference("dispatch", dispatch.id)
                    .note(format!("Departed via dispatch {}", dispatch.dispatch_number))
                    .actor(actor),
            )
            .await?;
            adjustments.push((updated.id, item.quantity, updated.quantity));

            move_units_in_transit(&txn, item, &dispatch).await?;
        }

        let now = Utc::now();
        let mut active: dispatch::ActiveModel = dispatch.into();
        active.status = Set(DispatchStatus::InTransit);
        active.updated_at = Set(Some(now));
        let dispatch = active.update(&txn).await?;
        txn.commit().await?;

        info!(dispatch_id = %dispatch.id, "Dispatch in transit");
        self.event_sender.send_or_log(Event::DispatchInTransit(dispatch.id)).await;
        for (batch_id, quantity, new_on_hand) in adjustments {
            self.event_sender
                .send_or_log(Event::StockAdjusted {
                    batch_id,
                    movement_type: MovementType::TransferOut,
                    quantity: -quantity,
                    new_on_hand,
                })
                .await;
        }
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Delivers an in-transit dispatch. Each item reconciles
    /// `received + damaged + missing == quantity`; the destination store gets
    /// a fresh batch credited with the received count, losses are written off
    /// in the ledger.
    #[instrument(skip(self, reports))]
    pub async fn deliver(
        &self,
        dispatch_id: Uuid,
        reports: Vec<DeliveryItemReport>,
        actor: Option<Uuid>,
    ) -> Result<DispatchWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_be_delivered() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only in-transit dispatches can be delivered, not {}",
                dispatch.status
            )));
        }

        let items = load_items(&txn, dispatch.id).await?;
        for report in &reports {
            if !items.iter().any(|i| i.id == report.dispatch_item_id) {
                return Err(ServiceError::ValidationError(format!(
                    "Delivery report references item {} which does not belong to dispatch {}",
                    report.dispatch_item_id, dispatch.dispatch_number
                )));
            }
        }
        let now = Utc::now();
        let mut adjustments = Vec::new();

        for item in &items {
            let report = reports
                .iter()
                .find(|r| r.dispatch_item_id == item.id);
            let (received, damaged, missing) = reconcile_counts(item, report)?;

            let source_batch = stock_ledger::lock_batch(&txn, item.batch_id).await?;
            let destination_batch =
                create_destination_batch(&txn, &dispatch, &source_batch, now).await?;

            if received > 0 {
                let updated = stock_ledger::add_stock(
                    &txn,
                    destination_batch.id,
                    received,
                    Movement::new(MovementType::TransferIn)
                        .reference("dispatch", dispatch.id)
                        .note(format!(
                            "Received via dispatch {}",
                            dispatch.dispatch_number
                        ))
                        .actor(actor),
                )
                .await?;
                adjustments.push((updated.id, received, updated.quantity));
            }
            if damaged > 0 {
                stock_ledger::record_loss(
                    &txn,
                    &destination_batch,
                    damaged,
                    Movement::new(MovementType::Damaged)
                        .reference("dispatch", dispatch.id)
                        .note(format!(
                            "Damaged in transit, dispatch {}",
                            dispatch.dispatch_number
                        ))
                        .actor(actor),
                )
                .await?;
            }
            if missing > 0 {
                stock_ledger::record_loss(
                    &txn,
                    &destination_batch,
                    missing,
                    Movement::new(MovementType::Missing)
                        .reference("dispatch", dispatch.id)
                        .note(format!(
                            "Missing in transit, dispatch {}",
                            dispatch.dispatch_number
                        ))
                        .actor(actor),
                )
                .await?;
            }

            receive_units(
                &txn,
                item,
                &dispatch,
                &destination_batch,
                received,
                damaged,
            )
            .await?;

            let mut active: dispatch_item::ActiveModel = item.clone().into();
            active.received_quantity = Set(Some(received));
            active.damaged_quantity = Set(Some(damaged));
            active.missing_quantity = Set(Some(missing));
            active.updated_at = Set(Some(now));
            active.update(&txn).await?;
        }

        let mut active: dispatch::ActiveModel = dispatch.into();
        active.status = Set(DispatchStatus::Delivered);
        active.actual_delivery_date = Set(Some(now));
        active.updated_at = Set(Some(now));
        let dispatch = active.update(&txn).await?;

        let items = load_items(&txn, dispatch.id).await?;
        txn.commit().await?;

        info!(dispatch_id = %dispatch.id, "Dispatch delivered");
        self.event_sender.send_or_log(Event::DispatchDelivered(dispatch.id)).await;
        for (batch_id, quantity, new_on_hand) in adjustments {
            self.event_sender
                .send_or_log(Event::StockAdjusted {
                    batch_id,
                    movement_type: MovementType::TransferIn,
                    quantity,
                    new_on_hand,
                })
                .await;
        }
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Cancels a dispatch before it departs. Stock was never debited in the
    /// pending/approved window, so releasing the reservations is enough.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        dispatch_id: Uuid,
        reason: Option<String>,
    ) -> Result<DispatchWithItems, ServiceError> {
        let txn = self.db.begin().await?;
        let dispatch = find_dispatch(&txn, dispatch_id).await?;
        if !dispatch.can_be_cancelled() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "A {} dispatch cannot be cancelled",
                dispatch.status
            )));
        }

        let items = load_items(&txn, dispatch.id).await?;
        for item in &items {
            close_reservations(&txn, item.id, ReservationStatus::Released).await?;
        }

        let now = Utc::now();
        let note = format!(
            "Cancelled: {}",
            reason.as_deref().unwrap_or("No reason provided")
        );
        let notes = match &dispatch.notes {
            Some(existing) => format!("{}\n{}", existing, note),
            None => note,
        };

        let mut active: dispatch::ActiveModel = dispatch.into();
        active.status = Set(DispatchStatus::Cancelled);
        active.notes = Set(Some(notes));
        active.updated_at = Set(Some(now));
        let dispatch = active.update(&txn).await?;
        txn.commit().await?;

        info!(dispatch_id = %dispatch.id, "Dispatch cancelled");
        self.event_sender.send_or_log(Event::DispatchCancelled(dispatch.id)).await;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Retrieves a dispatch with its items.
    #[instrument(skip(self))]
    pub async fn get_dispatch(&self, dispatch_id: Uuid) -> Result<DispatchWithItems, ServiceError> {
        let db = &*self.db;
        let dispatch = find_dispatch(db, dispatch_id).await?;
        let items = load_items(db, dispatch.id).await?;
        Ok(DispatchWithItems { dispatch, items })
    }

    /// Lists dispatches with pagination, newest first.
    #[instrument(skip(self))]
    pub async fn list_dispatches(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<DispatchListResponse, ServiceError> {
        let db = &*self.db;
        let paginator = Dispatch::find()
            .order_by_desc(dispatch::Column::CreatedAt)
            .paginate(db, per_page);

        let total = paginator.num_items().await?;
        let dispatches = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(DispatchListResponse {
            dispatches,
            total,
            page,
            per_page,
        })
    }
}

async fn find_dispatch<C: ConnectionTrait>(
    conn: &C,
    dispatch_id: Uuid,
) -> Result<dispatch::Model, ServiceError> {
    Dispatch::find_by_id(dispatch_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Dispatch {} not found", dispatch_id)))
}

async fn find_item<C: ConnectionTrait>(
    conn: &C,
    dispatch_id: Uuid,
    item_id: Uuid,
) -> Result<dispatch_item::Model, ServiceError> {
    DispatchItem::find_by_id(item_id)
        .filter(dispatch_item::Column::DispatchId.eq(dispatch_id))
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Dispatch item {} not found in this dispatch",
                item_id
            ))
        })
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    dispatch_id: Uuid,
) -> Result<Vec<dispatch_item::Model>, ServiceError> {
    Ok(DispatchItem::find()
        .filter(dispatch_item::Column::DispatchId.eq(dispatch_id))
        .order_by_asc(dispatch_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Validates the batch against the dispatch, checks availability, inserts
/// the item with prices frozen from the batch and places an active
/// reservation for its quantity.
async fn insert_item<C: ConnectionTrait>(
    conn: &C,
    dispatch: &dispatch::Model,
    batch_id: Uuid,
    quantity: i32,
) -> Result<dispatch_item::Model, ServiceError> {
    let batch = stock_ledger::lock_batch(conn, batch_id).await?;
    if batch.store_id != dispatch.source_store_id {
        return Err(ServiceError::ValidationError(format!(
            "Batch {} does not belong to the source store",
            batch.batch_number
        )));
    }
    if !batch.is_active {
        return Err(ServiceError::ValidationError(format!(
            "Batch {} is not active",
            batch.batch_number
        )));
    }

    let available = stock_ledger::available_quantity(conn, &batch).await?;
    if available < quantity {
        return Err(ServiceError::InsufficientStock {
            batch_id: batch.id,
            requested: quantity,
            available,
        });
    }

    let now = Utc::now();
    let item = dispatch_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        dispatch_id: Set(dispatch.id),
        batch_id: Set(batch.id),
        quantity: Set(quantity),
        received_quantity: Set(None),
        damaged_quantity: Set(None),
        missing_quantity: Set(None),
        unit_cost: Set(batch.cost_price),
        unit_price: Set(batch.sell_price),
        total_cost: Set((batch.cost_price * Decimal::from(quantity)).round_dp(2)),
        total_value: Set((batch.sell_price * Decimal::from(quantity)).round_dp(2)),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(conn)
    .await?;

    batch_reservation::ActiveModel {
        id: Set(Uuid::new_v4()),
        batch_id: Set(batch.id),
        dispatch_item_id: Set(item.id),
        quantity: Set(quantity),
        status: Set(ReservationStatus::Active),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(conn)
    .await?;

    Ok(item)
}

async fn close_reservations<C: ConnectionTrait>(
    conn: &C,
    dispatch_item_id: Uuid,
    status: ReservationStatus,
) -> Result<(), ServiceError> {
    let reservations = BatchReservation::find()
        .filter(batch_reservation::Column::DispatchItemId.eq(dispatch_item_id))
        .filter(batch_reservation::Column::Status.eq(ReservationStatus::Active))
        .all(conn)
        .await?;
    for reservation in reservations {
        let mut active: batch_reservation::ActiveModel = reservation.into();
        active.status = Set(status);
        active.updated_at = Set(Some(Utc::now()));
        active.update(conn).await?;
    }
    Ok(())
}

async fn recalculate_totals<C: ConnectionTrait>(
    conn: &C,
    dispatch: dispatch::Model,
) -> Result<dispatch::Model, ServiceError> {
    let items = load_items(conn, dispatch.id).await?;
    let total_items: i32 = items.iter().map(|i| i.quantity).sum();
    let total_cost: Decimal = items.iter().map(|i| i.total_cost).sum();
    let total_value: Decimal = items.iter().map(|i| i.total_value).sum();

    let mut active: dispatch::ActiveModel = dispatch.into();
    active.total_items = Set(total_items);
    active.total_cost = Set(total_cost);
    active.total_value = Set(total_value);
    active.updated_at = Set(Some(Utc::now()));
    Ok(active.update(conn).await?)
}

/// Resolves the receipt counts for one item. Counts must be non-negative and
/// sum to the dispatched quantity; an unreported item is a full receipt and
/// an unreported missing count absorbs whatever is unaccounted for.
fn reconcile_counts(
    item: &dispatch_item::Model,
    report: Option<&DeliveryItemReport>,
) -> Result<(i32, i32, i32), ServiceError> {
    let report = match report {
        Some(r) => r,
        None => return Ok((item.quantity, 0, 0)),
    };

    let damaged = report.damaged_quantity.unwrap_or(0);
    let received = report
        .received_quantity
        .unwrap_or(item.quantity - damaged - report.missing_quantity.unwrap_or(0));
    let missing = report
        .missing_quantity
        .unwrap_or(item.quantity - received - damaged);

    if received < 0 || damaged < 0 || missing < 0 {
        return Err(ServiceError::ValidationError(
            "Receipt counts cannot be negative".into(),
        ));
    }
    if received + damaged + missing != item.quantity {
        return Err(ServiceError::ValidationError(format!(
            "Receipt counts ({} received, {} damaged, {} missing) do not reconcile with the {} dispatched",
            received, damaged, missing, item.quantity
        )));
    }
    Ok((received, damaged, missing))
}

/// The destination gets its own batch with prices copied from the source, so
/// downstream sales at the destination freeze the same cost basis.
async fn create_destination_batch<C: ConnectionTrait>(
    conn: &C,
    dispatch: &dispatch::Model,
    source_batch: &product_batch::Model,
    now: DateTime<Utc>,
) -> Result<product_batch::Model, ServiceError> {
    Ok(product_batch::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(source_batch.product_id),
        store_id: Set(dispatch.destination_store_id),
        batch_number: Set(format!(
            "{}-{}",
            source_batch.batch_number, dispatch.dispatch_number
        )),
        quantity: Set(0),
        cost_price: Set(source_batch.cost_price),
        sell_price: Set(source_batch.sell_price),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(conn)
    .await?)
}

/// Puts the item's share of sellable scanned units on the truck, oldest
/// first, stamping each with the dispatch item it departed under. Units
/// already travelling with another dispatch are never picked up.
async fn move_units_in_transit<C: ConnectionTrait>(
    conn: &C,
    item: &dispatch_item::Model,
    dispatch: &dispatch::Model,
) -> Result<(), ServiceError> {
    let units = BarcodeUnit::find()
        .filter(barcode_unit::Column::BatchId.eq(item.batch_id))
        .filter(barcode_unit::Column::IsActive.eq(true))
        .filter(barcode_unit::Column::IsDefective.eq(false))
        .filter(barcode_unit::Column::DispatchItemId.is_null())
        .filter(barcode_unit::Column::CurrentStoreId.eq(dispatch.source_store_id))
        .order_by_asc(barcode_unit::Column::CreatedAt)
        .all(conn)
        .await?;

    let now = Utc::now();
    for unit in units.into_iter().take(item.quantity as usize) {
        let mut active: barcode_unit::ActiveModel = unit.into();
        active.dispatch_item_id = Set(Some(item.id));
        active.status = Set(UnitStatus::InTransit);
        active.location_updated_at = Set(Some(now));
        active.location_note = Set(Some(format!(
            "In transit via dispatch {}",
            dispatch.dispatch_number
        )));
        active.update(conn).await?;
    }
    Ok(())
}

/// Lands exactly the units that departed under this dispatch item: received
/// units join the destination batch and drop the travel link, damaged units
/// are disposed, the rest are deactivated as missing.
async fn receive_units<C: ConnectionTrait>(
    conn: &C,
    item: &dispatch_item::Model,
    dispatch: &dispatch::Model,
    destination_batch: &product_batch::Model,
    received: i32,
    damaged: i32,
) -> Result<(), ServiceError> {
    let units = BarcodeUnit::find()
        .filter(barcode_unit::Column::DispatchItemId.eq(item.id))
        .order_by_asc(barcode_unit::Column::CreatedAt)
        .all(conn)
        .await?;

    let now = Utc::now();
    for (idx, unit) in units.into_iter().enumerate() {
        let idx = idx as i32;
        let mut active: barcode_unit::ActiveModel = unit.into();
        if idx < received {
            active.dispatch_item_id = Set(None);
            active.batch_id = Set(destination_batch.id);
            active.current_store_id = Set(dispatch.destination_store_id);
            active.status = Set(UnitStatus::InWarehouse);
            active.location_note = Set(Some(format!(
                "Received via dispatch {}",
                dispatch.dispatch_number
            )));
        } else if idx < received + damaged {
            active.is_active = Set(false);
            active.status = Set(UnitStatus::Disposed);
            active.location_note = Set(Some(format!(
                "Damaged in transit, dispatch {}",
                dispatch.dispatch_number
            )));
        } else {
            active.is_active = Set(false);
            active.location_note = Set(Some(format!(
                "Missing in transit, dispatch {}",
                dispatch.dispatch_number
            )));
        }
        active.location_updated_at = Set(Some(now));
        active.update(conn).await?;
    }
    Ok(())
}

async fn generate_dispatch_number<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..10 {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        let candidate = format!("DSP-{}-{:06}", Utc::now().format("%Y%m%d"), suffix);
        let exists = Dispatch::find()
            .filter(dispatch::Column::DispatchNumber.eq(candidate.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !exists {
            return Ok(candidate);
        }
    }
    Err(ServiceError::InternalError(
        "Failed to generate a unique dispatch number".into(),
    ))
}
