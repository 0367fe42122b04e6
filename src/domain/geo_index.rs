//! Spatial lookup of stores near a delivery point.
//!
//! Distances are great-circle (Haversine) kilometres. Stores are bucketed into
//! fixed-size lat/lon cells so radius queries only scan neighbouring cells; the
//! same cells key the batching scheduler's pending pool.

use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Kilometres per degree of latitude
const KM_PER_DEGREE: f64 = 111.195;

/// Great-circle distance between two points in kilometres
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Proximity test used by batching
pub fn within(a: GeoPoint, b: GeoPoint, threshold_km: f64) -> bool {
    haversine_km(a, b) <= threshold_km
}

/// Grid cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoCell {
    /// Row index (latitude)
    pub row: i64,
    /// Column index (longitude)
    pub col: i64,
}

impl GeoCell {
    /// Cell containing `point` for a grid of `cell_size_deg` degrees
    pub fn of(point: GeoPoint, cell_size_deg: f64) -> Self {
        Self {
            row: (point.lat / cell_size_deg).floor() as i64,
            col: (point.lon / cell_size_deg).floor() as i64,
        }
    }
}

/// A store's indexed position
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSite {
    /// Store
    pub store_id: StoreId,
    /// Position
    pub location: GeoPoint,
}

/// A store with its distance from a query point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyStore {
    /// Store
    pub store_id: StoreId,
    /// Distance in kilometres
    pub distance_km: f64,
}

#[derive(Debug, Default)]
struct IndexState {
    sites: HashMap<StoreId, GeoPoint>,
    cells: HashMap<GeoCell, Vec<StoreId>>,
}

/// Thread-safe store location index
#[derive(Debug)]
pub struct GeoIndex {
    cell_size_deg: f64,
    state: RwLock<IndexState>,
}

impl GeoIndex {
    /// Creates an empty index with the given cell size in degrees
    pub fn new(cell_size_deg: f64) -> Self {
        Self {
            cell_size_deg,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Cell size in degrees
    pub fn cell_size_deg(&self) -> f64 {
        self.cell_size_deg
    }

    /// Cell containing `point`
    pub fn cell_of(&self, point: GeoPoint) -> GeoCell {
        GeoCell::of(point, self.cell_size_deg)
    }

    /// Adds or moves a store
    pub fn insert(&self, store_id: StoreId, location: GeoPoint) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("geo index write"))?;
        if let Some(previous) = state.sites.insert(store_id.clone(), location) {
            let old_cell = self.cell_of(previous);
            if let Some(ids) = state.cells.get_mut(&old_cell) {
                ids.retain(|id| id != &store_id);
            }
        }
        state
            .cells
            .entry(self.cell_of(location))
            .or_default()
            .push(store_id);
        Ok(())
    }

    /// Removes a store; deactivated stores must not be returned by queries
    pub fn remove(&self, store_id: &StoreId) -> DispatchResult<bool> {
        let mut state = self.state.write().map_err(lock_err("geo index write"))?;
        match state.sites.remove(store_id) {
            Some(location) => {
                let cell = self.cell_of(location);
                if let Some(ids) = state.cells.get_mut(&cell) {
                    ids.retain(|id| id != store_id);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Position of an indexed store
    pub fn location(&self, store_id: &StoreId) -> DispatchResult<Option<GeoPoint>> {
        let state = self.state.read().map_err(lock_err("geo index read"))?;
        Ok(state.sites.get(store_id).copied())
    }

    /// The `k` closest stores, nearest first; ties break by store id
    pub fn nearest(&self, point: GeoPoint, k: usize) -> DispatchResult<Vec<NearbyStore>> {
        let state = self.state.read().map_err(lock_err("geo index read"))?;
        let mut all: Vec<NearbyStore> = state
            .sites
            .iter()
            .map(|(id, loc)| NearbyStore {
                store_id: id.clone(),
                distance_km: haversine_km(point, *loc),
            })
            .collect();
        sort_by_distance(&mut all);
        all.truncate(k);
        Ok(all)
    }

    /// All stores within `radius_km`, nearest first
    pub fn within_radius(&self, point: GeoPoint, radius_km: f64) -> DispatchResult<Vec<NearbyStore>> {
        let state = self.state.read().map_err(lock_err("geo index read"))?;
        let center = self.cell_of(point);

        let lat_span = radius_km / KM_PER_DEGREE;
        // Longitude degrees shrink towards the poles
        let lon_scale = point.lat.to_radians().cos().abs().max(0.01);
        let lon_span = radius_km / (KM_PER_DEGREE * lon_scale);
        let row_reach = (lat_span / self.cell_size_deg).ceil() as i64 + 1;
        let col_reach = (lon_span / self.cell_size_deg).ceil() as i64 + 1;

        let mut found = Vec::new();
        for row in (center.row - row_reach)..=(center.row + row_reach) {
            for col in (center.col - col_reach)..=(center.col + col_reach) {
                let Some(ids) = state.cells.get(&GeoCell { row, col }) else {
                    continue;
                };
                for id in ids {
                    if let Some(loc) = state.sites.get(id) {
                        let distance_km = haversine_km(point, *loc);
                        if distance_km <= radius_km {
                            found.push(NearbyStore {
                                store_id: id.clone(),
                                distance_km,
                            });
                        }
                    }
                }
            }
        }
        sort_by_distance(&mut found);
        Ok(found)
    }

    /// Number of indexed stores
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.sites.len()).unwrap_or(0)
    }

    /// Returns true if no stores are indexed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_by_distance(stores: &mut [NearbyStore]) {
    stores.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.store_id.cmp(&b.store_id))
    });
}
