//! Order-fulfillment and inventory-unit lifecycle engine for a multi-channel
//! retail backend: counter, social-commerce and e-commerce orders over
//! batch-tracked, barcode-serialized stock, with inter-store dispatches and a
//! defective-unit resale workflow.

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod services;

use std::sync::Arc;

use db::DbPool;
use events::{Event, EventSender};
use services::{
    BarcodeService, CogsLedger, DefectiveService, DiscountPolicy, DispatchService,
    LoggingCogsLedger, OrderService, SeverityDiscountPolicy,
};
use tokio::sync::mpsc;

/// The wired-up service layer, shared by the HTTP surface and tests.
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub dispatches: DispatchService,
    pub defectives: DefectiveService,
    pub barcodes: BarcodeService,
}

impl AppServices {
    /// Builds the services with the default COGS ledger and discount policy,
    /// returning the event receiver for the caller to drain.
    pub fn new(db: Arc<DbPool>, event_buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        Self::with_dependencies(
            db,
            event_buffer,
            Arc::new(LoggingCogsLedger),
            Arc::new(SeverityDiscountPolicy),
        )
    }

    pub fn with_dependencies(
        db: Arc<DbPool>,
        event_buffer: usize,
        cogs_ledger: Arc<dyn CogsLedger>,
        discount_policy: Arc<dyn DiscountPolicy>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (event_sender, event_receiver) = events::channel(event_buffer);
        let services = Self::from_parts(db, event_sender, cogs_ledger, discount_policy);
        (services, event_receiver)
    }

    pub fn from_parts(
        db: Arc<DbPool>,
        event_sender: EventSender,
        cogs_ledger: Arc<dyn CogsLedger>,
        discount_policy: Arc<dyn DiscountPolicy>,
    ) -> Self {
        Self {
            orders: OrderService::new(db.clone(), event_sender.clone(), cogs_ledger),
            dispatches: DispatchService::new(db.clone(), event_sender.clone()),
            defectives: DefectiveService::new(db.clone(), event_sender.clone(), discount_policy),
            barcodes: BarcodeService::new(db, event_sender),
        }
    }
}
