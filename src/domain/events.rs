use crate::domain::{order::SubOrderStatus, types::*};
use serde::{Deserialize, Serialize};

/// Events pushed by store and rider clients.
///
/// Delivery upstream is at-least-once; `operation_id` lets the engine drop replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Store or rider moved a sub-order forward (or cancelled it)
    SubOrderStatus {
        /// Sub-order
        sub_order_id: SubOrderId,
        /// Requested state
        status: SubOrderStatus,
        /// Upstream operation identifier
        operation_id: Option<OperationId>,
        /// When the actor made the change
        at: Timestamp,
    },
    /// Store added stock
    Restock {
        /// Store
        store_id: StoreId,
        /// Product
        product_id: ProductId,
        /// Units added
        quantity: u32,
        /// Upstream operation identifier
        operation_id: OperationId,
        /// Event time
        at: Timestamp,
    },
    /// Rider reported a new position
    RiderLocation {
        /// Rider
        rider_id: RiderId,
        /// Position
        location: GeoPoint,
        /// Event time
        at: Timestamp,
    },
    /// Rider went online or offline
    RiderAvailability {
        /// Rider
        rider_id: RiderId,
        /// Accepting trips
        online: bool,
        /// Event time
        at: Timestamp,
    },
}

impl LifecycleEvent {
    /// Returns the timestamp of this event
    pub fn timestamp(&self) -> Timestamp {
        match self {
            LifecycleEvent::SubOrderStatus { at, .. }
            | LifecycleEvent::Restock { at, .. }
            | LifecycleEvent::RiderLocation { at, .. }
            | LifecycleEvent::RiderAvailability { at, .. } => *at,
        }
    }

    /// Short description of the subject, for logs
    pub fn subject(&self) -> String {
        match self {
            LifecycleEvent::SubOrderStatus {
                sub_order_id,
                status,
                ..
            } => format!("sub-order {} -> {}", sub_order_id, status),
            LifecycleEvent::Restock {
                store_id,
                product_id,
                quantity,
                ..
            } => format!("restock {}/{} +{}", store_id, product_id, quantity),
            LifecycleEvent::RiderLocation { rider_id, .. } => {
                format!("rider {} location", rider_id)
            }
            LifecycleEvent::RiderAvailability {
                rider_id, online, ..
            } => format!("rider {} online={}", rider_id, online),
        }
    }
}
