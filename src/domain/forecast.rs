//! Advisory demand estimates per (area, category).
//!
//! Observations are appended to a sample log and folded into an exponentially
//! weighted moving average over fixed time buckets. Buckets with no orders
//! count as zero. Nothing here gates assignment.

use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Observed order count for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandSample {
    /// Area
    pub area: AreaId,
    /// Category
    pub category: Category,
    /// Bucket index (epoch seconds / bucket width)
    pub bucket: i64,
    /// Orders observed
    pub count: u32,
}

/// Point estimate returned by `predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// Area
    pub area: AreaId,
    /// Category
    pub category: Category,
    /// Buckets ahead
    pub horizon: u32,
    /// Expected orders per bucket
    pub per_bucket: f64,
    /// Expected orders over the horizon
    pub total: f64,
    /// Samples behind the estimate
    pub samples: usize,
}

#[derive(Debug, Clone)]
struct Series {
    last_bucket: i64,
    open_count: u32,
    level: Option<f64>,
    samples: usize,
}

impl Series {
    fn fold(level: Option<f64>, alpha: f64, observed: f64) -> f64 {
        match level {
            Some(prev) => alpha * observed + (1.0 - alpha) * prev,
            None => observed,
        }
    }

    /// Closes the open bucket and any empty buckets up to `bucket`
    fn advance(&mut self, alpha: f64, bucket: i64) {
        if bucket <= self.last_bucket {
            return;
        }
        let level = Self::fold(self.level, alpha, f64::from(self.open_count));
        // Each empty bucket folds in a zero: level * (1 - alpha)^gap
        let gap = (bucket - self.last_bucket - 1).min(i64::from(i32::MAX)) as i32;
        self.level = Some(level * (1.0 - alpha).powi(gap));
        self.last_bucket = bucket;
        self.open_count = 0;
    }

    fn estimate(&self, alpha: f64) -> f64 {
        Self::fold(self.level, alpha, f64::from(self.open_count))
    }
}

#[derive(Debug, Default)]
struct ForecastState {
    log: Vec<DemandSample>,
    series: HashMap<(AreaId, Category), Series>,
}

/// Exponential-smoothing demand forecaster
#[derive(Debug)]
pub struct DemandForecaster {
    alpha: f64,
    bucket_secs: i64,
    state: RwLock<ForecastState>,
}

impl DemandForecaster {
    /// Creates a forecaster with smoothing factor `alpha` and bucket width
    pub fn new(alpha: f64, bucket_minutes: i64) -> Self {
        Self {
            alpha,
            bucket_secs: bucket_minutes.max(1) * 60,
            state: RwLock::new(ForecastState::default()),
        }
    }

    /// Bucket index of a timestamp
    pub fn bucket_of(&self, at: Timestamp) -> i64 {
        at.timestamp().div_euclid(self.bucket_secs)
    }

    /// Records `count` orders for a category in an area at `at`
    pub fn record(&self, area: &AreaId, category: &Category, at: Timestamp, count: u32) -> DispatchResult<()> {
        let bucket = self.bucket_of(at);
        self.record_sample(DemandSample {
            area: area.clone(),
            category: category.clone(),
            bucket,
            count,
        })
    }

    fn record_sample(&self, sample: DemandSample) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("forecast write"))?;
        let key = (sample.area.clone(), sample.category.clone());
        let series = state.series.entry(key).or_insert_with(|| Series {
            last_bucket: sample.bucket,
            open_count: 0,
            level: None,
            samples: 0,
        });
        if sample.bucket < series.last_bucket {
            debug!(
                "Late demand sample for {}/{} in bucket {} (open bucket {})",
                sample.area, sample.category, sample.bucket, series.last_bucket
            );
        } else {
            series.advance(self.alpha, sample.bucket);
            series.open_count = series.open_count.saturating_add(sample.count);
        }
        series.samples += 1;
        state.log.push(sample);
        Ok(())
    }

    /// Estimate for the next `horizon` buckets as of the last observation
    pub fn predict(&self, area: &AreaId, category: &Category, horizon: u32) -> DispatchResult<Forecast> {
        let state = self.state.read().map_err(lock_err("forecast read"))?;
        let series = state.series.get(&(area.clone(), category.clone())).cloned();
        Ok(self.forecast_of(area, category, horizon, series))
    }

    /// Like `predict`, but buckets between the last observation and `now`
    /// count as empty
    pub fn predict_at(
        &self,
        area: &AreaId,
        category: &Category,
        horizon: u32,
        now: Timestamp,
    ) -> DispatchResult<Forecast> {
        let state = self.state.read().map_err(lock_err("forecast read"))?;
        let series = state
            .series
            .get(&(area.clone(), category.clone()))
            .cloned()
            .map(|mut s| {
                s.advance(self.alpha, self.bucket_of(now));
                s
            });
        Ok(self.forecast_of(area, category, horizon, series))
    }

    fn forecast_of(&self, area: &AreaId, category: &Category, horizon: u32, series: Option<Series>) -> Forecast {
        let (per_bucket, samples) = series
            .map(|s| (s.estimate(self.alpha), s.samples))
            .unwrap_or((0.0, 0));
        Forecast {
            area: area.clone(),
            category: category.clone(),
            horizon,
            per_bucket,
            total: per_bucket * f64::from(horizon),
            samples,
        }
    }

    /// Forecasts for every category seen in an area, sorted by category
    pub fn predict_area(&self, area: &AreaId, horizon: u32, now: Timestamp) -> DispatchResult<Vec<Forecast>> {
        let mut categories: Vec<Category> = {
            let state = self.state.read().map_err(lock_err("forecast read"))?;
            state
                .series
                .keys()
                .filter(|(a, _)| a == area)
                .map(|(_, c)| c.clone())
                .collect()
        };
        categories.sort();
        categories
            .iter()
            .map(|c| self.predict_at(area, c, horizon, now))
            .collect()
    }

    /// Copy of the sample log in arrival order
    pub fn samples(&self) -> DispatchResult<Vec<DemandSample>> {
        let state = self.state.read().map_err(lock_err("forecast read"))?;
        Ok(state.log.clone())
    }

    /// Replays a sample log (snapshot restore)
    pub fn restore(&self, samples: Vec<DemandSample>) -> DispatchResult<()> {
        for sample in samples {
            self.record_sample(sample)?;
        }
        Ok(())
    }
}
