use super::collector::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use tokio::time::{Duration, Instant};

/// Renders metrics for scrapers and health checks
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    start_time: Instant,
}

impl MetricsExporter {
    /// Creates an exporter; uptime counts from here
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Returns the uptime since exporter creation
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, metrics: &MetricsSnapshot) -> String {
        let mut output = String::new();
        for (name, value) in &metrics.counters {
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, value);
        }
        for (name, value) in &metrics.gauges {
            let _ = writeln!(output, "# TYPE {} gauge", name);
            let _ = writeln!(output, "{} {}", name, value);
        }
        let _ = writeln!(output, "# TYPE dispatch_uptime_seconds gauge");
        let _ = writeln!(output, "dispatch_uptime_seconds {}", self.uptime().as_secs());
        output
    }

    /// Export metrics in JSON format
    pub fn export_json(&self, metrics: &MetricsSnapshot) -> Result<String, serde_json::Error> {
        let export_data = MetricsExport {
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.uptime().as_secs(),
            metrics: metrics.clone(),
        };
        serde_json::to_string_pretty(&export_data)
    }
}

impl Default for MetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics export data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExport {
    /// Timestamp when metrics were exported
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// System uptime in seconds
    pub uptime_seconds: u64,
    /// Counters and gauges
    pub metrics: MetricsSnapshot,
}

/// Health status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall system status
    pub status: String,
    /// System version
    pub version: String,
    /// System uptime in seconds
    pub uptime_seconds: u64,
    /// Timestamp of health check
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Health status of individual components
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Health status of an individual engine component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component status (healthy/degraded)
    pub status: String,
    /// Timestamp of last health check
    pub last_check: chrono::DateTime<chrono::Utc>,
    /// Optional details about component status
    pub details: Option<String>,
}

impl HealthStatus {
    /// Creates a new health status with the given version and uptime
    pub fn new(version: &str, uptime: Duration) -> Self {
        Self {
            status: "healthy".to_string(),
            version: version.to_string(),
            uptime_seconds: uptime.as_secs(),
            timestamp: chrono::Utc::now(),
            components: BTreeMap::new(),
        }
    }

    /// Adds a component and downgrades the overall status if it is not healthy
    pub fn add_component(&mut self, name: impl Into<String>, health: ComponentHealth) {
        if health.status != "healthy" {
            self.status = "degraded".to_string();
        }
        self.components.insert(name.into(), health);
    }

    /// Returns true if all components are healthy
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" && self.components.values().all(|c| c.status == "healthy")
    }
}

impl ComponentHealth {
    /// Creates a healthy component status
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            last_check: chrono::Utc::now(),
            details: None,
        }
    }

    /// Creates a healthy component status with a note
    pub fn healthy_with(details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::healthy()
        }
    }

    /// Creates a degraded component status with details
    pub fn degraded(details: impl Into<String>) -> Self {
        Self {
            status: "degraded".to_string(),
            last_check: chrono::Utc::now(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::metrics::collector::{MetricsCollector, IDLE_RIDERS, ORDERS_ASSIGNED};

    #[test]
    fn test_prometheus_export() {
        let collector = MetricsCollector::new();
        collector.add_to_counter(ORDERS_ASSIGNED, 3);
        collector.set_gauge(IDLE_RIDERS, 2);

        let text = MetricsExporter::default().export_prometheus(&collector.snapshot());
        assert!(text.contains("# TYPE dispatch_orders_assigned_total counter\ndispatch_orders_assigned_total 3\n"));
        assert!(text.contains("# TYPE dispatch_idle_riders gauge\ndispatch_idle_riders 2\n"));
        assert!(text.contains("dispatch_uptime_seconds"));
    }

    #[test]
    fn test_json_export() {
        let collector = MetricsCollector::new();
        collector.increment_counter(ORDERS_ASSIGNED);
        let json_output = MetricsExporter::default()
            .export_json(&collector.snapshot())
            .unwrap();
        assert!(json_output.contains(ORDERS_ASSIGNED));
        assert!(json_output.contains("uptime_seconds"));
    }

    #[test]
    fn test_health_status() {
        let mut health = HealthStatus::new("1.0.0", Duration::from_secs(3600));
        assert_eq!(health.uptime_seconds, 3600);
        assert!(health.is_healthy());

        health.add_component("inventory", ComponentHealth::healthy());
        assert!(health.is_healthy());

        health.add_component("riders", ComponentHealth::degraded("no idle riders"));
        assert!(!health.is_healthy());
        assert_eq!(health.status, "degraded");
    }
}
