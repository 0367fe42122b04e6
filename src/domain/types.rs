use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Creates an identifier from anything string-like
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            /// Returns the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Store identifier
    StoreId
);
string_id!(
    /// Product (SKU) identifier
    ProductId
);
string_id!(
    /// Customer identifier
    CustomerId
);
string_id!(
    /// Cart identifier
    CartId
);
string_id!(
    /// Order identifier
    OrderId
);
string_id!(
    /// Sub-order identifier (one per sourcing store)
    SubOrderId
);
string_id!(
    /// Delivery identifier (one per sub-order)
    DeliveryId
);
string_id!(
    /// Rider identifier
    RiderId
);
string_id!(
    /// Batch group identifier
    BatchGroupId
);
string_id!(
    /// Identifier carried by upstream events so replays can be detected
    OperationId
);
string_id!(
    /// Delivery area label (e.g. "downtown")
    AreaId
);
string_id!(
    /// Product category (e.g. "dairy")
    Category
);

/// Monetary amount with decimal precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(pub Decimal);

impl Money {
    /// Zero amount
    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    /// Returns true if the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Mul<u32> for Money {
    type Output = Money;

    fn mul(self, rhs: u32) -> Money {
        Money(self.0 * Decimal::from(rhs))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geographic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude
    pub lat: f64,
    /// Longitude
    pub lon: f64,
}

impl GeoPoint {
    /// Creates a new point
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Returns true if both coordinates are finite and within range
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lon)
    }
}

/// Timestamp for engine events
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Dispatch engine errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Not enough unreserved stock to satisfy a reservation
    #[error("Insufficient stock for {product} at {store}: requested {requested}, sellable {sellable}")]
    InsufficientStock {
        /// Store holding the stock
        store: StoreId,
        /// Product requested
        product: ProductId,
        /// Quantity requested
        requested: u32,
        /// Quantity available minus already reserved
        sellable: u32,
    },

    /// No active store within the service radius stocks the product
    #[error("No eligible store for product {0}")]
    NoEligibleStore(ProductId),

    /// Cart is empty or malformed
    #[error("Invalid cart: {0}")]
    InvalidCart(String),

    /// Sub-order transition skips a state or leaves a terminal state
    #[error("Illegal transition for {sub_order}: {from} -> {to}")]
    IllegalStateTransition {
        /// Sub-order being transitioned
        sub_order: SubOrderId,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// A concurrent reservation held the inventory key
    #[error("Reservation conflict: {0}")]
    ReservationConflict(String),

    /// Delivery waited past the batching timeout (advisory only)
    #[error("Delivery {delivery} pending for {waited_secs}s without a rider")]
    BatchingTimeout {
        /// Delivery still pending
        delivery: DeliveryId,
        /// Seconds since admission
        waited_secs: i64,
    },

    /// Commit or release exceeds the reserved quantity
    #[error("Reservation mismatch for {product} at {store}: requested {requested}, reserved {reserved}")]
    ReservationMismatch {
        /// Store holding the stock
        store: StoreId,
        /// Product
        product: ProductId,
        /// Quantity requested
        requested: u32,
        /// Quantity currently reserved
        reserved: u32,
    },

    /// Store not registered
    #[error("Unknown store: {0}")]
    UnknownStore(StoreId),

    /// Store does not list the product
    #[error("Unknown inventory record: {store}/{product}")]
    UnknownInventory {
        /// Store
        store: StoreId,
        /// Product
        product: ProductId,
    },

    /// Order not found
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    /// Sub-order not found
    #[error("Unknown sub-order: {0}")]
    UnknownSubOrder(SubOrderId),

    /// Delivery not found
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(DeliveryId),

    /// Rider not registered
    #[error("Unknown rider: {0}")]
    UnknownRider(RiderId),

    /// Cart not found
    #[error("Unknown cart: {0}")]
    UnknownCart(CartId),

    /// Lock error
    #[error("Lock error: {0}")]
    LockError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Config error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(String),
}

impl DispatchError {
    /// Short machine-readable kind used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InsufficientStock { .. } => "insufficient_stock",
            DispatchError::NoEligibleStore(_) => "no_eligible_store",
            DispatchError::InvalidCart(_) => "invalid_cart",
            DispatchError::IllegalStateTransition { .. } => "illegal_state_transition",
            DispatchError::ReservationConflict(_) => "reservation_conflict",
            DispatchError::BatchingTimeout { .. } => "batching_timeout",
            DispatchError::ReservationMismatch { .. } => "reservation_mismatch",
            DispatchError::UnknownStore(_) => "unknown_store",
            DispatchError::UnknownInventory { .. } => "unknown_inventory",
            DispatchError::UnknownOrder(_) => "unknown_order",
            DispatchError::UnknownSubOrder(_) => "unknown_sub_order",
            DispatchError::UnknownDelivery(_) => "unknown_delivery",
            DispatchError::UnknownRider(_) => "unknown_rider",
            DispatchError::UnknownCart(_) => "unknown_cart",
            DispatchError::LockError(_) => "lock_error",
            DispatchError::ParseError(_) => "parse_error",
            DispatchError::ConfigError(_) => "config_error",
            DispatchError::IoError(_) => "io_error",
            DispatchError::JsonError(_) => "json_error",
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::JsonError(err.to_string())
    }
}

/// Maps a poisoned lock into a `LockError`
pub(crate) fn lock_err<T>(what: &str) -> impl FnOnce(T) -> DispatchError + '_ {
    move |_| DispatchError::LockError(format!("Failed to acquire {what} lock"))
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;
