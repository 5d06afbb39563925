pub mod barcode_unit;
pub mod batch_reservation;
pub mod customer;
pub mod defective_unit;
pub mod dispatch;
pub mod dispatch_item;
pub mod order;
pub mod order_item;
pub mod product;
pub mod product_batch;
pub mod stock_movement;
pub mod store;

pub use barcode_unit::UnitStatus;
pub use batch_reservation::ReservationStatus;
pub use defective_unit::{DefectSeverity, DefectStatus};
pub use dispatch::DispatchStatus;
pub use order::{FulfillmentStatus, OrderStatus, OrderType, PaymentStatus};
pub use stock_movement::MovementType;
