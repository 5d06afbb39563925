//! Barcode unit registry: one row per physical unit, transitioned by order
//! completion, dispatch movement and defect handling. The transaction-scoped
//! helpers here are the only code that flips unit status or location.

use chrono::Utc;
use rand::Rng;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{
        barcode_unit::{self, Entity as BarcodeUnit},
        defective_unit::{self, Entity as DefectiveUnit},
        product_batch::{self, Entity as ProductBatch},
        UnitStatus,
    },
    errors::ServiceError,
    events::EventSender,
};

/// Scan read-model: the unit plus the batch it came from and any defect
/// record hanging off it.
#[derive(Debug)]
pub struct ScanResult {
    pub unit: barcode_unit::Model,
    pub batch: Option<product_batch::Model>,
    pub defective_record: Option<defective_unit::Model>,
}

#[derive(Clone)]
pub struct BarcodeService {
    db: Arc<DbPool>,
    #[allow(dead_code)]
    event_sender: EventSender,
}

impl BarcodeService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Looks up a unit and its context by scanned code.
    #[instrument(skip(self))]
    pub async fn scan(&self, code: &str) -> Result<ScanResult, ServiceError> {
        let db = &*self.db;
        let unit = find_unit(db, code).await?;
        let batch = ProductBatch::find_by_id(unit.batch_id).one(db).await?;
        let defective_record = DefectiveUnit::find()
            .filter(defective_unit::Column::BarcodeUnitId.eq(unit.id))
            .one(db)
            .await?;
        Ok(ScanResult {
            unit,
            batch,
            defective_record,
        })
    }

    /// Generates `count` new units for a batch at purchase-order receipt.
    /// Units start in the warehouse of the batch's store.
    #[instrument(skip(self))]
    pub async fn generate_units(
        &self,
        batch_id: Uuid,
        count: u32,
    ) -> Result<Vec<barcode_unit::Model>, ServiceError> {
        if count == 0 {
            return Err(ServiceError::ValidationError(
                "Unit count must be positive".into(),
            ));
        }

        let db = &*self.db;
        let batch = ProductBatch::find_by_id(batch_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))?;

        let mut units = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let code = generate_unique_code(db).await?;
            let unit = barcode_unit::ActiveModel {
                id: Set(Uuid::new_v4()),
                barcode: Set(code),
                product_id: Set(batch.product_id),
                batch_id: Set(batch.id),
                current_store_id: Set(batch.store_id),
                status: Set(UnitStatus::InWarehouse),
                is_active: Set(true),
                is_defective: Set(false),
                dispatch_item_id: Set(None),
                location_updated_at: Set(None),
                location_note: Set(None),
                created_at: Set(Utc::now()),
            };
            units.push(unit.insert(db).await?);
        }
        Ok(units)
    }
}

/// Resolves a scanned code to its unit row.
pub async fn find_unit<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<barcode_unit::Model, ServiceError> {
    BarcodeUnit::find()
        .filter(barcode_unit::Column::Barcode.eq(code))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::InvalidBarcode {
            barcode: code.to_string(),
            reason: "not found".into(),
        })
}

/// Validates a scanned code against the product, batch and (when known) store
/// being transacted. Returns the unit and its batch. This is the check every
/// normal-price consumer runs before using a barcode.
pub async fn validate_unit_for_sale<C: ConnectionTrait>(
    conn: &C,
    code: &str,
    product_id: Uuid,
    batch_id: Uuid,
    expected_store_id: Option<Uuid>,
) -> Result<(barcode_unit::Model, product_batch::Model), ServiceError> {
    let unit = find_unit(conn, code).await?;

    if unit.product_id != product_id || unit.batch_id != batch_id {
        return Err(ServiceError::InvalidBarcode {
            barcode: code.to_string(),
            reason: "does not belong to the product batch being transacted".into(),
        });
    }
    if !unit.is_active {
        return Err(ServiceError::InvalidBarcode {
            barcode: code.to_string(),
            reason: "is not active (already sold or deactivated)".into(),
        });
    }
    if unit.is_defective {
        return Err(ServiceError::InvalidBarcode {
            barcode: code.to_string(),
            reason: "is marked as defective".into(),
        });
    }

    let batch = ProductBatch::find_by_id(unit.batch_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", unit.batch_id)))?;

    if let Some(store_id) = expected_store_id {
        if batch.store_id != store_id {
            return Err(ServiceError::InvalidBarcode {
                barcode: code.to_string(),
                reason: "belongs to a different store".into(),
            });
        }
    }

    Ok((unit, batch))
}

/// Terminal sale transition: the unit leaves circulation for good.
pub async fn mark_sold<C: ConnectionTrait>(
    conn: &C,
    unit: barcode_unit::Model,
    order_number: &str,
    actor_id: Option<Uuid>,
) -> Result<barcode_unit::Model, ServiceError> {
    let note = match actor_id {
        Some(actor) => format!("sold via order {} by {}", order_number, actor),
        None => format!("sold via order {}", order_number),
    };
    let mut active: barcode_unit::ActiveModel = unit.into();
    active.is_active = Set(false);
    active.status = Set(UnitStatus::Sold);
    active.location_updated_at = Set(Some(Utc::now()));
    active.location_note = Set(Some(note));
    Ok(active.update(conn).await?)
}

/// Moves the unit to a new store and status. Dispatch delivery is the only
/// path that changes `current_store_id` for a healthy unit.
pub async fn relocate<C: ConnectionTrait>(
    conn: &C,
    unit: barcode_unit::Model,
    store_id: Uuid,
    status: UnitStatus,
    note: impl Into<String>,
) -> Result<barcode_unit::Model, ServiceError> {
    let mut active: barcode_unit::ActiveModel = unit.into();
    active.current_store_id = Set(store_id);
    active.status = Set(status);
    active.location_updated_at = Set(Some(Utc::now()));
    active.location_note = Set(Some(note.into()));
    Ok(active.update(conn).await?)
}

/// Generates a 12-digit code that does not collide with an existing unit.
async fn generate_unique_code<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..10 {
        let code: String = {
            let mut rng = rand::thread_rng();
            (0..12).map(|_| rng.gen_range(0..10).to_string()).collect()
        };
        let exists = BarcodeUnit::find()
            .filter(barcode_unit::Column::Barcode.eq(code.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !exists {
            return Ok(code);
        }
    }
    Err(ServiceError::InternalError(
        "Failed to generate a unique barcode".into(),
    ))
}
