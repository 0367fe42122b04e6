use crate::domain::{
    batching::Rider, dispatch::DispatchEngine, inventory::InventoryRecord, store::Store, types::*,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Raw seed file. Prices and ratings are strings so they survive as exact decimals.
#[derive(Debug, Deserialize)]
struct RawSeed {
    #[serde(default)]
    stores: Vec<RawStore>,
    #[serde(default)]
    inventory: Vec<RawListing>,
    #[serde(default)]
    riders: Vec<RawRider>,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    id: String,
    name: String,
    lat: f64,
    lon: f64,
    area: String,
    capacity: u32,
    rating: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawListing {
    store: String,
    product: String,
    category: String,
    price: String,
    available: u32,
    min_threshold: u32,
}

#[derive(Debug, Deserialize)]
struct RawRider {
    id: String,
    lat: f64,
    lon: f64,
    capacity: u32,
}

/// Parsed seed data
#[derive(Debug, Clone, PartialEq)]
pub struct SeedData {
    /// Stores to onboard
    pub stores: Vec<Store>,
    /// Listings
    pub inventory: Vec<InventoryRecord>,
    /// Riders
    pub riders: Vec<Rider>,
}

/// Parse a seed document
pub fn parse_seed(json_str: &str) -> DispatchResult<SeedData> {
    let raw: RawSeed = serde_json::from_str(json_str)?;

    let mut store_ids = HashSet::new();
    let mut stores = Vec::with_capacity(raw.stores.len());
    for s in raw.stores {
        if !store_ids.insert(s.id.clone()) {
            return Err(DispatchError::ParseError(format!("Duplicate store id: {}", s.id)));
        }
        let rating = f64::from_str(&s.rating)
            .map_err(|e| DispatchError::ParseError(format!("Invalid rating for {}: {}", s.id, e)))?;
        if !(0.0..=5.0).contains(&rating) {
            return Err(DispatchError::ParseError(format!(
                "Rating for {} out of range: {}",
                s.id, rating
            )));
        }
        let mut store = Store::new(
            StoreId(s.id),
            s.name,
            GeoPoint::new(s.lat, s.lon),
            AreaId(s.area),
            s.capacity,
            rating,
        );
        store.active = s.active;
        stores.push(store);
    }

    let mut inventory = Vec::with_capacity(raw.inventory.len());
    for l in raw.inventory {
        if !store_ids.contains(&l.store) {
            return Err(DispatchError::ParseError(format!(
                "Listing {} references unknown store {}",
                l.product, l.store
            )));
        }
        let price = Decimal::from_str(&l.price)
            .map_err(|e| DispatchError::ParseError(format!("Invalid price for {}: {}", l.product, e)))?;
        if price.is_sign_negative() {
            return Err(DispatchError::ParseError(format!("Negative price for {}", l.product)));
        }
        inventory.push(InventoryRecord::new(
            StoreId(l.store),
            ProductId(l.product),
            Category(l.category),
            Money(price),
            l.available,
            l.min_threshold,
        ));
    }

    let riders = raw
        .riders
        .into_iter()
        .map(|r| Rider::new(RiderId(r.id), GeoPoint::new(r.lat, r.lon), r.capacity))
        .collect();

    Ok(SeedData {
        stores,
        inventory,
        riders,
    })
}

/// Load and parse a seed file
pub fn load_seed(path: &Path) -> DispatchResult<SeedData> {
    let content = std::fs::read_to_string(path)?;
    parse_seed(&content)
}

/// Loads seed data into an engine
pub fn apply_seed(engine: &DispatchEngine, seed: SeedData) -> DispatchResult<()> {
    let (stores, listings, riders) = (seed.stores.len(), seed.inventory.len(), seed.riders.len());
    for store in seed.stores {
        engine.onboard_store(store)?;
    }
    for record in seed.inventory {
        engine.list_inventory(record)?;
    }
    for rider in seed.riders {
        engine.register_rider(rider)?;
    }
    info!("Seeded {} stores, {} listings, {} riders", stores, listings, riders);
    Ok(())
}
