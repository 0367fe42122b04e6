use crate::domain::{order::DeliveryMode, types::*};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// One requested product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product
    pub product_id: ProductId,
    /// Store the customer pinned, if any
    #[serde(default)]
    pub store_id: Option<StoreId>,
    /// Units
    pub quantity: u32,
}

/// Items one customer submits together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    /// Cart identifier
    pub id: CartId,
    /// Owner
    pub customer_id: CustomerId,
    /// Delivery area
    pub area: AreaId,
    /// Requested items, in insertion order
    pub items: Vec<CartItem>,
    /// Delivery mode
    pub delivery_mode: DeliveryMode,
}

impl Cart {
    /// Checks the cart is submittable
    pub fn validate(&self) -> DispatchResult<()> {
        if self.items.is_empty() {
            return Err(DispatchError::InvalidCart(format!("cart {} is empty", self.id)));
        }
        if let Some(item) = self.items.iter().find(|i| i.quantity == 0) {
            return Err(DispatchError::InvalidCart(format!(
                "product {} has zero quantity",
                item.product_id
            )));
        }
        if self.items.iter().any(|i| i.product_id.as_str().is_empty()) {
            return Err(DispatchError::InvalidCart("empty product id".to_string()));
        }
        Ok(())
    }
}

/// Per-customer cart storage; a cart is consumed when it is assigned
#[derive(Debug, Default)]
pub struct CartService {
    carts: RwLock<HashMap<CartId, Cart>>,
    next_id: AtomicU64,
}

impl CartService {
    /// Creates an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cart for a customer
    pub fn create(
        &self,
        customer_id: CustomerId,
        area: AreaId,
        delivery_mode: DeliveryMode,
    ) -> DispatchResult<Cart> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cart = Cart {
            id: CartId(format!("CART-{:06}", seq)),
            customer_id,
            area,
            items: Vec::new(),
            delivery_mode,
        };
        let mut carts = self.carts.write().map_err(lock_err("cart write"))?;
        carts.insert(cart.id.clone(), cart.clone());
        Ok(cart)
    }

    /// Adds units of a product; same product and store pin accumulate
    pub fn add_item(&self, cart_id: &CartId, item: CartItem) -> DispatchResult<Cart> {
        if item.quantity == 0 {
            return Err(DispatchError::InvalidCart(format!(
                "product {} has zero quantity",
                item.product_id
            )));
        }
        let mut carts = self.carts.write().map_err(lock_err("cart write"))?;
        let cart = carts
            .get_mut(cart_id)
            .ok_or_else(|| DispatchError::UnknownCart(cart_id.clone()))?;
        match cart
            .items
            .iter_mut()
            .find(|i| i.product_id == item.product_id && i.store_id == item.store_id)
        {
            Some(existing) => {
                existing.quantity = existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                    DispatchError::InvalidCart(format!("quantity of {} overflows", item.product_id))
                })?;
            }
            None => cart.items.push(item),
        }
        Ok(cart.clone())
    }

    /// Removes a product (any store pin)
    pub fn remove_item(&self, cart_id: &CartId, product_id: &ProductId) -> DispatchResult<Cart> {
        let mut carts = self.carts.write().map_err(lock_err("cart write"))?;
        let cart = carts
            .get_mut(cart_id)
            .ok_or_else(|| DispatchError::UnknownCart(cart_id.clone()))?;
        cart.items.retain(|i| &i.product_id != product_id);
        Ok(cart.clone())
    }

    /// Reads a cart
    pub fn get(&self, cart_id: &CartId) -> DispatchResult<Cart> {
        let carts = self.carts.read().map_err(lock_err("cart read"))?;
        carts
            .get(cart_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownCart(cart_id.clone()))
    }

    /// Removes and returns a cart for checkout
    pub fn take(&self, cart_id: &CartId) -> DispatchResult<Cart> {
        let mut carts = self.carts.write().map_err(lock_err("cart write"))?;
        carts
            .remove(cart_id)
            .ok_or_else(|| DispatchError::UnknownCart(cart_id.clone()))
    }

    /// Puts a cart back, e.g. after a checkout where nothing could be reserved
    pub fn put_back(&self, cart: Cart) -> DispatchResult<()> {
        let mut carts = self.carts.write().map_err(lock_err("cart write"))?;
        carts.insert(cart.id.clone(), cart);
        Ok(())
    }

    /// Open carts sorted by id
    pub fn all(&self) -> DispatchResult<Vec<Cart>> {
        let carts = self.carts.read().map_err(lock_err("cart read"))?;
        let mut all: Vec<Cart> = carts.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Re-inserts a cart from a snapshot; new ids continue after it
    pub fn restore(&self, cart: Cart) -> DispatchResult<()> {
        if let Some(n) = cart.id.as_str().rsplit('-').next().and_then(|n| n.parse().ok()) {
            self.next_id.fetch_max(n, Ordering::SeqCst);
        }
        self.put_back(cart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product: &str, quantity: u32) -> CartItem {
        CartItem {
            product_id: ProductId::new(product),
            store_id: None,
            quantity,
        }
    }

    #[test]
    fn test_cart_lifecycle() {
        let service = CartService::new();
        let cart = service
            .create(CustomerId::new("c1"), AreaId::new("downtown"), DeliveryMode::Instant)
            .unwrap();
        assert_eq!(cart.id, CartId::new("CART-000001"));

        service.add_item(&cart.id, item("milk", 1)).unwrap();
        let cart = service.add_item(&cart.id, item("milk", 2)).unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);

        let cart = service.remove_item(&cart.id, &ProductId::new("milk")).unwrap();
        assert!(cart.items.is_empty());
        assert!(matches!(cart.validate(), Err(DispatchError::InvalidCart(_))));

        let taken = service.take(&cart.id).unwrap();
        assert!(matches!(
            service.get(&taken.id),
            Err(DispatchError::UnknownCart(_))
        ));
    }

    #[test]
    fn test_quantity_overflow_rejected_and_cart_stays_usable() {
        let service = CartService::new();
        let cart = service
            .create(CustomerId::new("c1"), AreaId::new("downtown"), DeliveryMode::Instant)
            .unwrap();
        service.add_item(&cart.id, item("milk", 3_000_000_000)).unwrap();

        let err = service
            .add_item(&cart.id, item("milk", 3_000_000_000))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidCart(_)));

        let cart = service.get(&cart.id).unwrap();
        assert_eq!(cart.items[0].quantity, 3_000_000_000);
        service.add_item(&cart.id, item("bread", 1)).unwrap();
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let service = CartService::new();
        let cart = service
            .create(CustomerId::new("c1"), AreaId::new("downtown"), DeliveryMode::Instant)
            .unwrap();
        assert!(service.add_item(&cart.id, item("milk", 0)).is_err());
    }
}
