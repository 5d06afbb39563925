use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::MovementType;

/// Fire-and-forget sender for domain events. Failure to enqueue is the
/// caller's problem to log, never to propagate: events must not block or
/// roll back the operation that produced them.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging (not propagating) any failure.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

/// Creates a connected sender/receiver pair with the given buffer size.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

// The events the core can emit. Consumers (audit log, notifications,
// webhooks) subscribe through the processing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderItemsChanged(Uuid),
    OrderStoresAssigned(Uuid),
    OrderFulfilled(Uuid),
    OrderCompleted(Uuid),
    OrderCancelled(Uuid),

    // Stock ledger
    StockAdjusted {
        batch_id: Uuid,
        movement_type: MovementType,
        quantity: i32,
        new_on_hand: i32,
    },

    // Dispatch lifecycle
    DispatchCreated(Uuid),
    DispatchApproved(Uuid),
    DispatchInTransit(Uuid),
    DispatchDelivered(Uuid),
    DispatchCancelled(Uuid),

    // Barcode unit lifecycle
    UnitSold {
        barcode_unit_id: Uuid,
        order_id: Uuid,
    },
    UnitMarkedDefective {
        barcode_unit_id: Uuid,
        defective_unit_id: Uuid,
    },

    // Defective-unit workflow
    DefectiveInspected(Uuid),
    DefectiveAvailableForSale(Uuid),
    DefectiveSold {
        defective_unit_id: Uuid,
        order_id: Option<Uuid>,
    },
    DefectiveDisposed(Uuid),
    DefectiveReturnedToVendor(Uuid),
}

/// Drains the event channel, logging each event. Real deployments hang
/// audit-log and webhook consumers off this loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        info!(?event, "Processing domain event");
    }
}
