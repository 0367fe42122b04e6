use crate::domain::types::{DispatchError, DispatchResult, Money};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Store selection and pricing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Weight of 1/distance
    pub w_distance: f64,
    /// Weight of store rating
    pub w_rating: f64,
    /// Weight of stock sufficiency (0..1)
    pub w_stock: f64,
    /// Weight of the load penalty
    pub w_load: f64,
    /// Stores further than this are not considered for unpinned items
    pub service_radius_km: f64,
    /// Fee for a single-store order
    pub base_fee: Money,
    /// Surcharge per additional store
    pub split_fee: Money,
    /// Promise window for instant deliveries
    pub instant_window_minutes: i64,
    /// Tries on a contended inventory key before `ReservationConflict`
    pub max_lock_attempts: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            w_distance: 1.0,
            w_rating: 0.5,
            w_stock: 2.0,
            w_load: 1.5,
            service_radius_km: 5.0,
            base_fee: Money(Decimal::from(40)),
            split_fee: Money(Decimal::from(20)),
            instant_window_minutes: 30,
            max_lock_attempts: 64,
        }
    }
}

/// Delivery batching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Max distance between drop points in one batch
    pub proximity_km: f64,
    /// Max deliveries per batch
    pub max_batch_size: usize,
    /// Run a cycle once the oldest pending delivery waited this long
    pub timeout_secs: i64,
    /// Worker tick
    pub interval_ms: u64,
    /// Rider bonus for completing a whole batch
    pub batch_bonus: Money,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            proximity_km: 1.0,
            max_batch_size: 3,
            timeout_secs: 90,
            interval_ms: 1000,
            batch_bonus: Money(Decimal::from(50)),
        }
    }
}

/// Load tier parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Medium tier starts at this percent
    pub medium_percent: f64,
    /// High tier starts at this percent
    pub high_percent: f64,
    /// Penalty multiplier once in the high tier
    pub high_load_multiplier: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            medium_percent: 50.0,
            high_percent: 80.0,
            high_load_multiplier: 2.0,
        }
    }
}

/// Demand forecasting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Smoothing factor
    pub alpha: f64,
    /// Bucket width
    pub bucket_minutes: i64,
    /// How often forecasts are pushed into load projections
    pub refresh_secs: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            bucket_minutes: 60,
            refresh_secs: 60,
        }
    }
}

/// Spatial index parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Grid cell size in degrees
    pub cell_size_deg: f64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            cell_size_deg: 0.01,
        }
    }
}

/// HTTP server and state files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Seed file loaded at start when no snapshot exists
    pub seed_path: Option<PathBuf>,
    /// Snapshot file restored at start and written at shutdown
    pub snapshot_path: Option<PathBuf>,
    /// Lifecycle event channel size
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            seed_path: Some(PathBuf::from("data/seed.json")),
            snapshot_path: None,
            event_buffer: 1000,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Assignment
    pub assignment: AssignmentConfig,
    /// Batching
    pub batching: BatchingConfig,
    /// Load tiers
    pub load: LoadConfig,
    /// Forecasting
    pub forecast: ForecastConfig,
    /// Spatial index
    pub geo: GeoConfig,
    /// Server
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Loads configuration.
    ///
    /// Environment variables:
    /// - DISPATCH_CONFIG: path of a JSON config file (defaults otherwise)
    /// - DISPATCH_PORT: overrides `server.port`
    pub fn load() -> DispatchResult<Self> {
        let mut config = match env::var("DISPATCH_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        if let Ok(port) = env::var("DISPATCH_PORT") {
            config.server.port = port
                .parse()
                .map_err(|e| DispatchError::ConfigError(format!("DISPATCH_PORT: {}", e)))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config file; missing fields take defaults
    pub fn from_file(path: &Path) -> DispatchResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parses a JSON config document
    pub fn from_json(raw: &str) -> DispatchResult<Self> {
        serde_json::from_str(raw).map_err(|e| DispatchError::ConfigError(e.to_string()))
    }

    /// Rejects values the engine cannot work with
    pub fn validate(&self) -> DispatchResult<()> {
        let a = &self.assignment;
        if [a.w_distance, a.w_rating, a.w_stock, a.w_load]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(DispatchError::ConfigError(
                "assignment weights must be non-negative".to_string(),
            ));
        }
        if a.service_radius_km <= 0.0 {
            return Err(DispatchError::ConfigError(
                "service_radius_km must be positive".to_string(),
            ));
        }
        if a.base_fee.0.is_sign_negative() || a.split_fee.0.is_sign_negative() {
            return Err(DispatchError::ConfigError("fees must be non-negative".to_string()));
        }
        if self.batching.max_batch_size == 0 {
            return Err(DispatchError::ConfigError(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.batching.proximity_km < 0.0 || self.batching.timeout_secs < 0 {
            return Err(DispatchError::ConfigError(
                "batching proximity and timeout must be non-negative".to_string(),
            ));
        }
        if !(self.forecast.alpha > 0.0 && self.forecast.alpha <= 1.0) {
            return Err(DispatchError::ConfigError("alpha must be in (0, 1]".to_string()));
        }
        if self.forecast.bucket_minutes <= 0 {
            return Err(DispatchError::ConfigError(
                "bucket_minutes must be positive".to_string(),
            ));
        }
        if self.load.medium_percent >= self.load.high_percent {
            return Err(DispatchError::ConfigError(
                "medium_percent must be below high_percent".to_string(),
            ));
        }
        if self.geo.cell_size_deg <= 0.0 {
            return Err(DispatchError::ConfigError(
                "cell_size_deg must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.assignment.base_fee, Money(dec!(40)));
        assert_eq!(config.assignment.split_fee, Money(dec!(20)));
        assert_eq!(config.batching.max_batch_size, 3);
        assert_eq!(config.batching.timeout_secs, 90);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "assignment": { "base_fee": "35" }, "batching": { "max_batch_size": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.assignment.base_fee, Money(dec!(35)));
        assert_eq!(config.assignment.split_fee, Money(dec!(20)));
        assert_eq!(config.batching.max_batch_size, 2);
        assert_eq!(config.server.port, 3030);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::default();
        config.forecast.alpha = 0.0;
        assert!(matches!(config.validate(), Err(DispatchError::ConfigError(_))));

        let mut config = EngineConfig::default();
        config.load.medium_percent = 90.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.assignment.w_load = -1.0;
        assert!(config.validate().is_err());
    }
}
