use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the customer wants the order delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Deliver as soon as possible
    Instant,
    /// Deliver in a slot starting at the given time
    Scheduled {
        /// Slot start
        slot_start: Timestamp,
    },
}

/// Fulfillment state of one sub-order.
///
/// `New -> Preparing -> Ready -> PickedUp -> Delivered`, with `Cancelled`
/// reachable only before pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubOrderStatus {
    /// Accepted, stock reserved
    New,
    /// Store is packing
    Preparing,
    /// Packed, waiting for the rider
    Ready,
    /// Rider collected it; reservation committed
    PickedUp,
    /// Handed to the customer
    Delivered,
    /// Abandoned before pickup; reservation released
    Cancelled,
}

impl SubOrderStatus {
    /// Returns true for `Delivered` and `Cancelled`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubOrderStatus::Delivered | SubOrderStatus::Cancelled)
    }

    /// The single forward successor, if any
    pub fn next(&self) -> Option<SubOrderStatus> {
        match self {
            SubOrderStatus::New => Some(SubOrderStatus::Preparing),
            SubOrderStatus::Preparing => Some(SubOrderStatus::Ready),
            SubOrderStatus::Ready => Some(SubOrderStatus::PickedUp),
            SubOrderStatus::PickedUp => Some(SubOrderStatus::Delivered),
            SubOrderStatus::Delivered | SubOrderStatus::Cancelled => None,
        }
    }

    /// Whether `self -> to` is a legal single step
    pub fn can_transition_to(&self, to: SubOrderStatus) -> bool {
        match to {
            SubOrderStatus::Cancelled => matches!(
                self,
                SubOrderStatus::New | SubOrderStatus::Preparing | SubOrderStatus::Ready
            ),
            _ => self.next() == Some(to),
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            SubOrderStatus::New => "new",
            SubOrderStatus::Preparing => "preparing",
            SubOrderStatus::Ready => "ready",
            SubOrderStatus::PickedUp => "picked_up",
            SubOrderStatus::Delivered => "delivered",
            SubOrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Previous state
    pub from: SubOrderStatus,
    /// New state
    pub to: SubOrderStatus,
    /// When the change was applied
    pub at: Timestamp,
    /// Upstream operation that caused it
    pub operation_id: Option<OperationId>,
}

/// A priced, reserved line within a sub-order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Product
    pub product_id: ProductId,
    /// Product category
    pub category: Category,
    /// Quantity reserved
    pub quantity: u32,
    /// Unit price at reservation time
    pub unit_price: Money,
}

impl OrderLine {
    /// Quantity times unit price
    pub fn line_total(&self) -> Money {
        self.unit_price * self.quantity
    }
}

/// The portion of an order sourced from one store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOrder {
    /// Sub-order identifier
    pub id: SubOrderId,
    /// Parent order
    pub order_id: OrderId,
    /// Sourcing store
    pub store_id: StoreId,
    /// Reserved lines
    pub lines: Vec<OrderLine>,
    /// Current state
    pub status: SubOrderStatus,
    /// Transition history
    pub history: Vec<StatusChange>,
    /// Creation time
    pub created_at: Timestamp,
}

impl SubOrder {
    /// Sum of line totals
    pub fn items_total(&self) -> Money {
        self.lines
            .iter()
            .fold(Money::zero(), |acc, line| acc + line.line_total())
    }

    /// Returns true if `operation_id` already drove a transition here
    pub fn has_applied(&self, operation_id: &OperationId) -> bool {
        self.history
            .iter()
            .any(|change| change.operation_id.as_ref() == Some(operation_id))
    }
}

/// Aggregate state of an order, derived from its sub-orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// At least one sub-order is still in flight
    Active,
    /// Every sub-order was delivered
    Completed,
    /// Every sub-order was cancelled
    Cancelled,
    /// All terminal, some delivered and some cancelled
    PartiallyFulfilled,
}

impl OrderStatus {
    /// Derives the order state from sub-order states
    pub fn derive<'a>(statuses: impl IntoIterator<Item = &'a SubOrderStatus>) -> Self {
        let mut delivered = 0usize;
        let mut cancelled = 0usize;
        for status in statuses {
            match status {
                SubOrderStatus::Delivered => delivered += 1,
                SubOrderStatus::Cancelled => cancelled += 1,
                _ => return OrderStatus::Active,
            }
        }
        match (delivered, cancelled) {
            (0, 0) => OrderStatus::Active,
            (_, 0) => OrderStatus::Completed,
            (0, _) => OrderStatus::Cancelled,
            _ => OrderStatus::PartiallyFulfilled,
        }
    }
}

/// A store group from the cart that could not be reserved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfulfilledGroup {
    /// Store the group targeted, if one was selected
    pub store_id: Option<StoreId>,
    /// Products in the group
    pub products: Vec<ProductId>,
    /// Why it failed
    pub reason: String,
    /// Error kind, see `DispatchError::kind`
    pub kind: String,
}

/// Customer order with one sub-order per sourcing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Customer
    pub customer_id: CustomerId,
    /// Delivery area
    pub area: AreaId,
    /// Drop location
    pub drop_location: GeoPoint,
    /// Delivery mode
    pub delivery_mode: DeliveryMode,
    /// Sub-orders, one per store
    pub sub_orders: Vec<SubOrder>,
    /// Groups that failed reservation
    pub unfulfilled: Vec<UnfulfilledGroup>,
    /// Sum of sub-order item totals
    pub items_total: Money,
    /// Delivery fee including split-cart surcharge
    pub delivery_fee: Money,
    /// items_total + delivery_fee
    pub total: Money,
    /// Creation time
    pub created_at: Timestamp,
}

impl Order {
    /// Aggregate status
    pub fn status(&self) -> OrderStatus {
        OrderStatus::derive(self.sub_orders.iter().map(|s| &s.status))
    }

    /// Number of sourcing stores
    pub fn store_count(&self) -> usize {
        self.sub_orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_forward_chain_only() {
        use SubOrderStatus::*;
        assert!(New.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(PickedUp));
        assert!(PickedUp.can_transition_to(Delivered));

        assert!(!New.can_transition_to(PickedUp));
        assert!(!New.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Preparing));
        assert!(!Delivered.can_transition_to(Delivered));
    }

    #[test]
    fn test_cancel_only_before_pickup() {
        use SubOrderStatus::*;
        assert!(New.can_transition_to(Cancelled));
        assert!(Ready.can_transition_to(Cancelled));
        assert!(!PickedUp.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn test_order_status_derivation() {
        use SubOrderStatus::*;
        assert_eq!(OrderStatus::derive(&[New, Delivered]), OrderStatus::Active);
        assert_eq!(OrderStatus::derive(&[Delivered, Delivered]), OrderStatus::Completed);
        assert_eq!(OrderStatus::derive(&[Cancelled]), OrderStatus::Cancelled);
        assert_eq!(
            OrderStatus::derive(&[Delivered, Cancelled]),
            OrderStatus::PartiallyFulfilled
        );
    }

    #[test]
    fn test_line_totals() {
        let line = OrderLine {
            product_id: ProductId::new("milk"),
            category: Category::new("dairy"),
            quantity: 3,
            unit_price: Money(dec!(28.50)),
        };
        assert_eq!(line.line_total(), Money(dec!(85.50)));
    }
}
