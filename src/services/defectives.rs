//! Defective-unit workflow: a scanned unit flagged as defective leaves
//! sellable stock immediately and opens a side record that walks
//! identified → inspected → available_for_sale → sold, or is disposed of /
//! returned to the vendor. Discounted sales must clear a severity-based
//! price floor.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::{
        barcode_unit,
        defective_unit::{self, Entity as DefectiveUnit},
        DefectSeverity, DefectStatus, MovementType, UnitStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        barcodes, orders,
        stock_ledger::{self, Movement},
    },
};

/// Prices a defective unit from its original selling price and severity.
/// The suggested price is a starting point for negotiation; the minimum is a
/// hard floor enforced at sale time.
pub trait DiscountPolicy: Send + Sync {
    fn suggested_price(&self, original: Decimal, severity: DefectSeverity) -> Decimal;
    fn minimum_price(&self, original: Decimal, severity: DefectSeverity) -> Decimal;
}

/// Default policy: the discount deepens and the floor drops with severity.
#[derive(Debug, Default, Clone)]
pub struct SeverityDiscountPolicy;

impl DiscountPolicy for SeverityDiscountPolicy {
    fn suggested_price(&self, original: Decimal, severity: DefectSeverity) -> Decimal {
        let multiplier = match severity {
            DefectSeverity::Minor => dec!(0.90),
            DefectSeverity::Moderate => dec!(0.75),
            DefectSeverity::Major => dec!(0.50),
            DefectSeverity::Critical => dec!(0.30),
        };
        (original * multiplier).round_dp(2)
    }

    fn minimum_price(&self, original: Decimal, severity: DefectSeverity) -> Decimal {
        let multiplier = match severity {
            DefectSeverity::Minor => dec!(0.30),
            DefectSeverity::Moderate => dec!(0.20),
            DefectSeverity::Major => dec!(0.15),
            DefectSeverity::Critical => dec!(0.10),
        };
        (original * multiplier).round_dp(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MarkDefectiveRequest {
    #[validate(length(min = 1, message = "Barcode is required"))]
    pub barcode: String,
    pub severity: DefectSeverity,
    #[validate(length(min = 1, message = "Defect type is required"))]
    pub defect_type: String,
    pub defect_description: Option<String>,
    pub identified_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectRequest {
    /// Inspection may revise the initial severity; prices are re-derived.
    pub severity: Option<DefectSeverity>,
    pub defect_description: Option<String>,
    pub inspected_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellDefectiveRequest {
    pub price: Decimal,
    pub order_id: Option<Uuid>,
    pub sold_by: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DefectiveListResponse {
    pub records: Vec<defective_unit::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Clone)]
pub struct DefectiveService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    policy: Arc<dyn DiscountPolicy>,
}

impl DefectiveService {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, policy: Arc<dyn DiscountPolicy>) -> Self {
        Self {
            db,
            event_sender,
            policy,
        }
    }

    /// Flags a scanned unit as defective. The unit leaves sellable stock in
    /// the same transaction and an `identified` record opens with prices
    /// derived from the batch's selling price.
    #[instrument(skip(self, request), fields(barcode = %request.barcode))]
    pub async fn mark_defective(
        &self,
        request: MarkDefectiveRequest,
    ) -> Result<defective_unit::Model, ServiceError> {
        request.validate()?;

        let txn = self.db.begin().await?;
        let unit = barcodes::find_unit(&txn, &request.barcode).await?;
        if !unit.can_be_marked_defective() {
            let reason = if unit.is_defective {
                "is already marked as defective"
            } else {
                "is not active (already sold or deactivated)"
            };
            return Err(ServiceError::InvalidBarcode {
                barcode: unit.barcode,
                reason: reason.into(),
            });
        }
        // A unit claimed by an open order stays on that order: the line has
        // to come off first, or the order completes and the unit is sold.
        orders::ensure_unit_unclaimed(&txn, &unit).await?;

        let batch = stock_ledger::lock_batch(&txn, unit.batch_id).await?;
        let original = batch.sell_price;
        let now = Utc::now();

        let mut active: barcode_unit::ActiveModel = unit.clone().into();
        active.is_defective = Set(true);
        active.location_note = Set(Some(format!("Marked defective: {}", request.defect_type)));
        active.location_updated_at = Set(Some(now));
        let unit = active.update(&txn).await?;

        let record = defective_unit::ActiveModel {
            id: Set(Uuid::new_v4()),
            barcode_unit_id: Set(unit.id),
            product_id: Set(unit.product_id),
            batch_id: Set(Some(batch.id)),
            store_id: Set(unit.current_store_id),
            status: Set(DefectStatus::Identified),
            severity: Set(request.severity),
            defect_type: Set(request.defect_type.clone()),
            defect_description: Set(request.defect_description.clone()),
            original_price: Set(original),
            suggested_selling_price: Set(self.policy.suggested_price(original, request.severity)),
            minimum_selling_price: Set(self.policy.minimum_price(original, request.severity)),
            actual_selling_price: Set(None),
            sold_order_id: Set(None),
            identified_by: Set(request.identified_by),
            inspected_by: Set(None),
            inspected_at: Set(None),
            resolved_at: Set(None),
            resolution_notes: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        stock_ledger::remove_stock(
            &txn,
            batch.id,
            1,
            Movement::new(MovementType::Defective)
                .reference("defective_unit", record.id)
                .note(format!("Unit {} marked defective", unit.barcode))
                .actor(request.identified_by),
        )
        .await?;

        txn.commit().await?;

        info!(defective_unit_id = %record.id, barcode = %unit.barcode, "Unit marked defective");
        self.event_sender
            .send_or_log(Event::UnitMarkedDefective {
                barcode_unit_id: unit.id,
                defective_unit_id: record.id,
            })
            .await;
        Ok(record)
    }

    /// Records the inspection outcome, optionally revising severity (and
    /// with it the suggested and minimum prices).
    #[instrument(skip(self, request))]
    pub async fn inspect(
        &self,
        defective_unit_id: Uuid,
        request: InspectRequest,
    ) -> Result<defective_unit::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let record = find_record(&txn, defective_unit_id).await?;
        if record.status != DefectStatus::Identified {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only identified defects can be inspected, not {}",
                record.status
            )));
        }

        let severity = request.severity.unwrap_or(record.severity);
        let original = record.original_price;
        let now = Utc::now();

        let mut active: defective_unit::ActiveModel = record.into();
        active.status = Set(DefectStatus::Inspected);
        active.severity = Set(severity);
        active.suggested_selling_price = Set(self.policy.suggested_price(original, severity));
        active.minimum_selling_price = Set(self.policy.minimum_price(original, severity));
        if let Some(description) = request.defect_description {
            active.defect_description = Set(Some(description));
        }
        active.inspected_by = Set(request.inspected_by);
        active.inspected_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let record = active.update(&txn).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::DefectiveInspected(record.id)).await;
        Ok(record)
    }

    /// Puts an inspected defect on the discounted shelf.
    #[instrument(skip(self))]
    pub async fn make_available_for_sale(
        &self,
        defective_unit_id: Uuid,
    ) -> Result<defective_unit::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let record = find_record(&txn, defective_unit_id).await?;
        if record.status != DefectStatus::Inspected {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Only inspected defects can be put up for sale, not {}",
                record.status
            )));
        }

        let barcode_unit_id = record.barcode_unit_id;
        let store_id = record.store_id;
        let mut active: defective_unit::ActiveModel = record.into();
        active.status = Set(DefectStatus::AvailableForSale);
        active.updated_at = Set(Some(Utc::now()));
        let record = active.update(&txn).await?;

        // The physical unit goes on display for the discounted sale.
        if let Some(unit) = barcode_unit::Entity::find_by_id(barcode_unit_id)
            .one(&txn)
            .await?
        {
            barcodes::relocate(
                &txn,
                unit,
                store_id,
                UnitStatus::OnDisplay,
                "Available for discounted sale",
            )
            .await?;
        }

        txn.commit().await?;
        self.event_sender
            .send_or_log(Event::DefectiveAvailableForSale(record.id))
            .await;
        Ok(record)
    }

    /// Sells a defective unit at a negotiated price. The price must clear
    /// the minimum floor; stock was already debited when the defect was
    /// identified, so only the unit and record change hands.
    #[instrument(skip(self, request))]
    pub async fn sell(
        &self,
        defective_unit_id: Uuid,
        request: SellDefectiveRequest,
    ) -> Result<defective_unit::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let record = find_record(&txn, defective_unit_id).await?;
        if !record.can_be_sold() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Defective unit is not available for sale (status: {})",
                record.status
            )));
        }
        if request.price < record.minimum_selling_price {
            return Err(ServiceError::PriceBelowMinimum {
                offered: request.price,
                minimum: record.minimum_selling_price,
            });
        }

        let now = Utc::now();
        let barcode_unit_id = record.barcode_unit_id;
        let mut active: defective_unit::ActiveModel = record.into();
        active.status = Set(DefectStatus::Sold);
        active.actual_selling_price = Set(Some(request.price));
        active.sold_order_id = Set(request.order_id);
        active.resolved_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let record = active.update(&txn).await?;

        if let Some(unit) = barcode_unit::Entity::find_by_id(barcode_unit_id)
            .one(&txn)
            .await?
        {
            let mut active: barcode_unit::ActiveModel = unit.into();
            active.is_active = Set(false);
            active.status = Set(UnitStatus::Sold);
            active.location_note = Set(Some(format!("Sold as defective at {}", request.price)));
            active.location_updated_at = Set(Some(now));
            active.update(&txn).await?;
        }

        txn.commit().await?;

        info!(defective_unit_id = %record.id, price = %request.price, "Defective unit sold");
        self.event_sender
            .send_or_log(Event::DefectiveSold {
                defective_unit_id: record.id,
                order_id: request.order_id,
            })
            .await;
        Ok(record)
    }

    /// Writes the unit off entirely.
    #[instrument(skip(self))]
    pub async fn dispose(
        &self,
        defective_unit_id: Uuid,
        notes: Option<String>,
    ) -> Result<defective_unit::Model, ServiceError> {
        let record = self
            .resolve(
                defective_unit_id,
                DefectStatus::Disposed,
                UnitStatus::Disposed,
                notes,
            )
            .await?;
        self.event_sender.send_or_log(Event::DefectiveDisposed(record.id)).await;
        Ok(record)
    }

    /// Sends the unit back to the vendor.
    #[instrument(skip(self))]
    pub async fn return_to_vendor(
        &self,
        defective_unit_id: Uuid,
        notes: Option<String>,
    ) -> Result<defective_unit::Model, ServiceError> {
        let record = self
            .resolve(
                defective_unit_id,
                DefectStatus::ReturnedToVendor,
                UnitStatus::ReturnedToVendor,
                notes,
            )
            .await?;
        self.event_sender
            .send_or_log(Event::DefectiveReturnedToVendor(record.id))
            .await;
        Ok(record)
    }

    async fn resolve(
        &self,
        defective_unit_id: Uuid,
        status: DefectStatus,
        unit_status: UnitStatus,
        notes: Option<String>,
    ) -> Result<defective_unit::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let record = find_record(&txn, defective_unit_id).await?;
        if record.is_resolved() {
            return Err(ServiceError::InvalidStateTransition(format!(
                "Defective unit is already resolved ({})",
                record.status
            )));
        }

        let now = Utc::now();
        let barcode_unit_id = record.barcode_unit_id;
        let mut active: defective_unit::ActiveModel = record.into();
        active.status = Set(status);
        active.resolved_at = Set(Some(now));
        active.resolution_notes = Set(notes);
        active.updated_at = Set(Some(now));
        let record = active.update(&txn).await?;

        if let Some(unit) = barcode_unit::Entity::find_by_id(barcode_unit_id)
            .one(&txn)
            .await?
        {
            let mut active: barcode_unit::ActiveModel = unit.into();
            active.is_active = Set(false);
            active.status = Set(unit_status);
            active.location_updated_at = Set(Some(now));
            active.update(&txn).await?;
        }

        txn.commit().await?;
        info!(defective_unit_id = %record.id, status = %record.status, "Defective unit resolved");
        Ok(record)
    }

    /// Retrieves a defect record.
    #[instrument(skip(self))]
    pub async fn get_record(
        &self,
        defective_unit_id: Uuid,
    ) -> Result<defective_unit::Model, ServiceError> {
        find_record(&*self.db, defective_unit_id).await
    }

    /// Lists defect records, optionally filtered to unresolved ones.
    #[instrument(skip(self))]
    pub async fn list_records(
        &self,
        status: Option<DefectStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<DefectiveListResponse, ServiceError> {
        let db = &*self.db;
        let mut query = DefectiveUnit::find().order_by_desc(defective_unit::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(defective_unit::Column::Status.eq(status));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator.num_items().await?;
        let records = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(DefectiveListResponse {
            records,
            total,
            page,
            per_page,
        })
    }
}

async fn find_record<C: sea_orm::ConnectionTrait>(
    conn: &C,
    defective_unit_id: Uuid,
) -> Result<defective_unit::Model, ServiceError> {
    DefectiveUnit::find_by_id(defective_unit_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Defective unit record {} not found",
                defective_unit_id
            ))
        })
}
