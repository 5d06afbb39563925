//! Business services. Each service owns one aggregate and runs its
//! operations as short transactions against the shared pool; cross-cutting
//! stock arithmetic lives in `stock_ledger` and is only ever called from
//! inside those transactions.

pub mod accounting;
pub mod barcodes;
pub mod defectives;
pub mod dispatches;
pub mod orders;
pub mod stock_ledger;

pub use accounting::{CogsLedger, LoggingCogsLedger};
pub use barcodes::BarcodeService;
pub use defectives::{DefectiveService, DiscountPolicy, SeverityDiscountPolicy};
pub use dispatches::DispatchService;
pub use orders::OrderService;
