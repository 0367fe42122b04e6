use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A dark store / partner grocery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    /// Store identifier
    pub id: StoreId,
    /// Display name
    pub name: String,
    /// Pickup location
    pub location: GeoPoint,
    /// Area the store serves, used for demand aggregation
    pub area: AreaId,
    /// Max concurrent active orders before the store is considered loaded
    pub capacity: u32,
    /// Customer rating, 0.0 to 5.0
    pub rating: f64,
    /// Deactivated stores keep their history but receive no new orders
    pub active: bool,
}

impl Store {
    /// Creates an active store
    pub fn new(
        id: StoreId,
        name: impl Into<String>,
        location: GeoPoint,
        area: AreaId,
        capacity: u32,
        rating: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            location,
            area,
            capacity,
            rating,
            active: true,
        }
    }
}

/// Registry of onboarded stores. Stores are never removed, only deactivated.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: RwLock<HashMap<StoreId, Store>>,
}

impl StoreRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Onboards (or re-onboards) a store
    pub fn register(&self, store: Store) -> DispatchResult<()> {
        if !store.location.is_valid() {
            return Err(DispatchError::ParseError(format!(
                "Store {} has invalid location {}",
                store.id, store.location
            )));
        }
        if store.capacity == 0 {
            return Err(DispatchError::ParseError(format!(
                "Store {} must have a positive capacity",
                store.id
            )));
        }
        let mut stores = self.stores.write().map_err(lock_err("store registry write"))?;
        stores.insert(store.id.clone(), store);
        Ok(())
    }

    /// Marks a store inactive
    pub fn deactivate(&self, id: &StoreId) -> DispatchResult<Store> {
        let mut stores = self.stores.write().map_err(lock_err("store registry write"))?;
        let store = stores
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownStore(id.clone()))?;
        store.active = false;
        Ok(store.clone())
    }

    /// Looks up a store
    pub fn get(&self, id: &StoreId) -> DispatchResult<Store> {
        let stores = self.stores.read().map_err(lock_err("store registry read"))?;
        stores
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownStore(id.clone()))
    }

    /// Looks up a store and requires it to be active
    pub fn get_active(&self, id: &StoreId) -> DispatchResult<Store> {
        let store = self.get(id)?;
        if store.active {
            Ok(store)
        } else {
            Err(DispatchError::UnknownStore(id.clone()))
        }
    }

    /// All stores sorted by id
    pub fn all(&self) -> DispatchResult<Vec<Store>> {
        let stores = self.stores.read().map_err(lock_err("store registry read"))?;
        let mut all: Vec<Store> = stores.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Active stores in an area
    pub fn active_in_area(&self, area: &AreaId) -> DispatchResult<Vec<Store>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.active && &s.area == area)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(id: &str, area: &str) -> Store {
        Store::new(
            StoreId::new(id),
            id,
            GeoPoint::new(12.97, 77.59),
            AreaId::new(area),
            20,
            4.5,
        )
    }

    #[test]
    fn test_register_and_deactivate() {
        let registry = StoreRegistry::new();
        registry.register(store("s1", "downtown")).unwrap();
        registry.register(store("s2", "downtown")).unwrap();

        assert_eq!(registry.active_in_area(&AreaId::new("downtown")).unwrap().len(), 2);

        let deactivated = registry.deactivate(&StoreId::new("s1")).unwrap();
        assert!(!deactivated.active);
        assert_eq!(registry.active_in_area(&AreaId::new("downtown")).unwrap().len(), 1);

        // Still present for history
        assert!(registry.get(&StoreId::new("s1")).is_ok());
        assert!(matches!(
            registry.get_active(&StoreId::new("s1")),
            Err(DispatchError::UnknownStore(_))
        ));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let registry = StoreRegistry::new();
        let mut bad = store("s1", "downtown");
        bad.capacity = 0;
        assert!(registry.register(bad).is_err());
    }
}
