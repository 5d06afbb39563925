//! Batch quantity arithmetic. Every stock mutation in the system goes through
//! `remove_stock`/`add_stock` so the non-negative invariant holds and each
//! change leaves a ledger row behind.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use uuid::Uuid;

use crate::{
    entities::{
        batch_reservation::{self, Entity as BatchReservation},
        product_batch::{self, Entity as ProductBatch},
        stock_movement, MovementType, ReservationStatus,
    },
    errors::ServiceError,
};

/// Attribution for a stock mutation, persisted on the movement row.
#[derive(Debug, Clone)]
pub struct Movement {
    pub movement_type: MovementType,
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub note: Option<String>,
    pub actor_id: Option<Uuid>,
}

impl Movement {
    pub fn new(movement_type: MovementType) -> Self {
        Self {
            movement_type,
            reference_type: None,
            reference_id: None,
            note: None,
            actor_id: None,
        }
    }

    pub fn reference(mut self, kind: &str, id: Uuid) -> Self {
        self.reference_type = Some(kind.to_string());
        self.reference_id = Some(id);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn actor(mut self, actor_id: Option<Uuid>) -> Self {
        self.actor_id = actor_id;
        self
    }
}

/// Fetches the batch under a row-level exclusive lock. Callers must already
/// be inside a transaction; the lock is held until that transaction ends.
pub async fn lock_batch<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
) -> Result<product_batch::Model, ServiceError> {
    ProductBatch::find_by_id(batch_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))
}

/// Quantity currently held by active dispatch reservations against the batch.
pub async fn reserved_quantity<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
) -> Result<i32, ServiceError> {
    let reservations = BatchReservation::find()
        .filter(batch_reservation::Column::BatchId.eq(batch_id))
        .filter(batch_reservation::Column::Status.eq(ReservationStatus::Active))
        .all(conn)
        .await?;
    Ok(reservations.iter().map(|r| r.quantity).sum())
}

/// On-hand quantity minus active reservations.
pub async fn available_quantity<C: ConnectionTrait>(
    conn: &C,
    batch: &product_batch::Model,
) -> Result<i32, ServiceError> {
    let reserved = reserved_quantity(conn, batch.id).await?;
    Ok(batch.quantity - reserved)
}

/// Decrements the batch by `qty`, failing fast if the result would go
/// negative or would eat into active reservations. Returns the updated batch.
pub async fn remove_stock<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
    qty: i32,
    movement: Movement,
) -> Result<product_batch::Model, ServiceError> {
    if qty <= 0 {
        return Err(ServiceError::ValidationError(
            "Stock removal quantity must be positive".into(),
        ));
    }

    let batch = lock_batch(conn, batch_id).await?;
    let available = available_quantity(conn, &batch).await?;
    if available < qty {
        return Err(ServiceError::InsufficientStock {
            batch_id,
            requested: qty,
            available,
        });
    }

    apply_delta(conn, batch, -qty, movement).await
}

/// Increments the batch by `qty`. Returns the updated batch.
pub async fn add_stock<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
    qty: i32,
    movement: Movement,
) -> Result<product_batch::Model, ServiceError> {
    if qty <= 0 {
        return Err(ServiceError::ValidationError(
            "Stock addition quantity must be positive".into(),
        ));
    }

    let batch = lock_batch(conn, batch_id).await?;
    apply_delta(conn, batch, qty, movement).await
}

/// Writes a ledger row without touching any on-hand count. Used for goods
/// lost between stores: the source was already debited when the dispatch
/// departed, so the write-off is documentary.
pub async fn record_loss<C: ConnectionTrait>(
    conn: &C,
    batch: &product_batch::Model,
    qty: i32,
    movement: Movement,
) -> Result<(), ServiceError> {
    if qty <= 0 {
        return Err(ServiceError::ValidationError(
            "Write-off quantity must be positive".into(),
        ));
    }

    let ledger_row = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        batch_id: Set(batch.id),
        store_id: Set(batch.store_id),
        movement_type: Set(movement.movement_type),
        quantity: Set(-qty),
        unit_cost: Set(Some(batch.cost_price)),
        reference_type: Set(movement.reference_type),
        reference_id: Set(movement.reference_id),
        note: Set(movement.note),
        actor_id: Set(movement.actor_id),
        occurred_at: Set(Utc::now()),
    };
    ledger_row.insert(conn).await?;
    Ok(())
}

async fn apply_delta<C: ConnectionTrait>(
    conn: &C,
    batch: product_batch::Model,
    delta: i32,
    movement: Movement,
) -> Result<product_batch::Model, ServiceError> {
    let now = Utc::now();
    let new_quantity = batch.quantity + delta;
    let batch_store_id = batch.store_id;
    let batch_id = batch.id;
    let unit_cost = batch.cost_price;

    let mut active: product_batch::ActiveModel = batch.into();
    active.quantity = Set(new_quantity);
    active.updated_at = Set(Some(now));
    let updated = active.update(conn).await?;

    let ledger_row = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        batch_id: Set(batch_id),
        store_id: Set(batch_store_id),
        movement_type: Set(movement.movement_type),
        quantity: Set(delta),
        unit_cost: Set(Some(unit_cost)),
        reference_type: Set(movement.reference_type),
        reference_id: Set(movement.reference_id),
        note: Set(movement.note),
        actor_id: Set(movement.actor_id),
        occurred_at: Set(now),
    };
    ledger_row.insert(conn).await?;

    Ok(updated)
}
