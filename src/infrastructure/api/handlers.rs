use crate::domain::{
    batching::Rider,
    cart::CartItem,
    dispatch::DispatchEngine,
    events::LifecycleEvent,
    order::{DeliveryMode, SubOrderStatus},
    types::*,
};
use crate::infrastructure::ingestion::SharedStats;
use crate::infrastructure::metrics::{ComponentHealth, HealthStatus, MetricsExporter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};
use warp::http::StatusCode;
use warp::reply::{self, Reply, Response};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ApiContext {
    /// Engine
    pub engine: Arc<DispatchEngine>,
    /// Prometheus and health rendering
    pub exporter: Arc<MetricsExporter>,
    /// Wakes the batching worker after a checkout
    pub nudge: Arc<Notify>,
    /// Lifecycle ingestion statistics, when an ingester runs
    pub ingestion: Option<SharedStats>,
    /// Feeds the lifecycle event ingester
    pub events: Option<mpsc::Sender<LifecycleEvent>>,
}

impl ApiContext {
    /// Creates a context without ingestion statistics
    pub fn new(engine: Arc<DispatchEngine>, nudge: Arc<Notify>) -> Self {
        Self {
            engine,
            exporter: Arc::new(MetricsExporter::new()),
            nudge,
            ingestion: None,
            events: None,
        }
    }

    /// Accepts lifecycle events on `POST /events`
    pub fn with_events(mut self, sender: mpsc::Sender<LifecycleEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Reports ingestion statistics on `/health`
    pub fn with_ingestion(mut self, stats: SharedStats) -> Self {
        self.ingestion = Some(stats);
        self
    }
}

/// JSON error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable kind
    pub error: String,
    /// Human-readable message
    pub message: String,
}

/// Opens a cart
#[derive(Debug, Deserialize)]
pub struct CreateCartRequest {
    /// Owner
    pub customer_id: CustomerId,
    /// Delivery area
    pub area: AreaId,
    /// Instant unless a slot is given
    #[serde(default = "instant")]
    pub delivery_mode: DeliveryMode,
}

fn instant() -> DeliveryMode {
    DeliveryMode::Instant
}

/// Checkout body
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    /// Drop location
    pub location: GeoPoint,
}

/// Store or rider status change
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    /// Requested state
    pub status: SubOrderStatus,
    /// Upstream operation id for replay detection
    #[serde(default)]
    pub operation_id: Option<OperationId>,
}

/// Rider registration
#[derive(Debug, Deserialize)]
pub struct RiderRequest {
    /// Rider id
    pub id: RiderId,
    /// Current position
    pub location: GeoPoint,
    /// Deliveries the rider can carry at once
    pub capacity: u32,
}

/// `?horizon=` on the demand route
#[derive(Debug, Deserialize)]
pub struct DemandQuery {
    /// Buckets ahead, default 1
    pub horizon: Option<u32>,
}

/// HTTP status for an engine error
pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::InvalidCart(_) | DispatchError::ParseError(_) => StatusCode::BAD_REQUEST,
        DispatchError::UnknownStore(_)
        | DispatchError::UnknownInventory { .. }
        | DispatchError::UnknownOrder(_)
        | DispatchError::UnknownSubOrder(_)
        | DispatchError::UnknownDelivery(_)
        | DispatchError::UnknownRider(_)
        | DispatchError::UnknownCart(_) => StatusCode::NOT_FOUND,
        DispatchError::InsufficientStock { .. }
        | DispatchError::NoEligibleStore(_)
        | DispatchError::ReservationConflict(_)
        | DispatchError::IllegalStateTransition { .. }
        | DispatchError::ReservationMismatch { .. } => StatusCode::CONFLICT,
        DispatchError::BatchingTimeout { .. }
        | DispatchError::LockError(_)
        | DispatchError::ConfigError(_)
        | DispatchError::IoError(_)
        | DispatchError::JsonError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds a JSON error response
pub fn error_reply(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: kind.to_string(),
        message: message.into(),
    };
    reply::with_status(reply::json(&body), status).into_response()
}

fn dispatch_error(err: &DispatchError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }
    error_reply(status, err.kind(), err.to_string())
}

fn respond<T: Serialize>(result: DispatchResult<T>, ok: StatusCode) -> Result<Response, Infallible> {
    Ok(match result {
        Ok(value) => reply::with_status(reply::json(&value), ok).into_response(),
        Err(e) => dispatch_error(&e),
    })
}

/// POST /carts
pub async fn create_cart(req: CreateCartRequest, ctx: ApiContext) -> Result<Response, Infallible> {
    respond(
        ctx.engine
            .carts()
            .create(req.customer_id, req.area, req.delivery_mode),
        StatusCode::CREATED,
    )
}

/// POST /carts/{id}/items
pub async fn add_cart_item(id: String, item: CartItem, ctx: ApiContext) -> Result<Response, Infallible> {
    respond(ctx.engine.carts().add_item(&CartId(id), item), StatusCode::OK)
}

/// GET /carts/{id}
pub async fn get_cart(id: String, ctx: ApiContext) -> Result<Response, Infallible> {
    respond(ctx.engine.carts().get(&CartId(id)), StatusCode::OK)
}

/// POST /carts/{id}/assign
pub async fn assign_cart(id: String, req: AssignRequest, ctx: ApiContext) -> Result<Response, Infallible> {
    let result = ctx.engine.assign_cart(&CartId(id), req.location, Utc::now());
    if result.is_ok() {
        ctx.nudge.notify_one();
    }
    respond(result, StatusCode::CREATED)
}

/// PATCH /suborders/{id}/status
pub async fn update_sub_order_status(
    id: String,
    req: StatusRequest,
    ctx: ApiContext,
) -> Result<Response, Infallible> {
    respond(
        ctx.engine
            .update_sub_order_status(&SubOrderId(id), req.status, req.operation_id, Utc::now()),
        StatusCode::OK,
    )
}

/// GET /orders/{id}
pub async fn get_order(id: String, ctx: ApiContext) -> Result<Response, Infallible> {
    respond(ctx.engine.order(&OrderId(id)), StatusCode::OK)
}

/// GET /stores/{id}/load
pub async fn store_load(id: String, ctx: ApiContext) -> Result<Response, Infallible> {
    respond(ctx.engine.store_load(&StoreId(id)), StatusCode::OK)
}

/// GET /stores/load
pub async fn load_overview(ctx: ApiContext) -> Result<Response, Infallible> {
    respond(ctx.engine.load_overview(), StatusCode::OK)
}

/// GET /demand/{area}/{category}
pub async fn demand(
    area: String,
    category: String,
    query: DemandQuery,
    ctx: ApiContext,
) -> Result<Response, Infallible> {
    let horizon = query.horizon.unwrap_or(1);
    if horizon == 0 {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "invalid_query",
            "horizon must be at least 1",
        ));
    }
    respond(
        ctx.engine
            .demand(&AreaId(area), &Category(category), horizon, Utc::now()),
        StatusCode::OK,
    )
}

/// POST /riders
pub async fn register_rider(req: RiderRequest, ctx: ApiContext) -> Result<Response, Infallible> {
    let result = ctx
        .engine
        .register_rider(Rider::new(req.id, req.location, req.capacity));
    if result.is_ok() {
        ctx.nudge.notify_one();
    }
    respond(result, StatusCode::CREATED)
}

/// POST /events: queues a store or rider event for the ingester
pub async fn submit_event(event: LifecycleEvent, ctx: ApiContext) -> Result<Response, Infallible> {
    let Some(sender) = &ctx.events else {
        return Ok(error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingestion_unavailable",
            "event ingestion is not running",
        ));
    };
    let subject = event.subject();
    Ok(match sender.try_send(event) {
        Ok(()) => reply::with_status(
            reply::json(&serde_json::json!({ "queued": subject })),
            StatusCode::ACCEPTED,
        )
        .into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingestion_backpressure",
            "event queue is full, retry later",
        ),
        Err(mpsc::error::TrySendError::Closed(_)) => error_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingestion_unavailable",
            "event ingester has stopped",
        ),
    })
}

/// GET /metrics
pub async fn metrics(ctx: ApiContext) -> Result<Response, Infallible> {
    ctx.engine.refresh_gauges();
    let body = ctx
        .exporter
        .export_prometheus(&ctx.engine.metrics().snapshot());
    Ok(reply::with_header(body, "content-type", "text/plain; version=0.0.4").into_response())
}

/// Builds the health report
pub fn health_report(ctx: &ApiContext) -> HealthStatus {
    let engine = &ctx.engine;
    let mut health = HealthStatus::new(crate::VERSION, ctx.exporter.uptime());

    let pending = engine.batching().pending_count();
    let idle = engine.batching().idle_riders();
    let batching = if pending > 0 && idle == 0 {
        ComponentHealth::degraded(format!("{} deliveries pending, no idle rider", pending))
    } else {
        ComponentHealth::healthy_with(format!("{} pending, {} idle riders", pending, idle))
    };
    health.add_component("batching", batching);

    let load = match engine.load_overview() {
        Ok(overview) => {
            let overloaded = overview.alerts.iter().filter(|a| !a.projected_only).count();
            if overloaded > 0 {
                ComponentHealth::degraded(format!("{} stores at high load", overloaded))
            } else {
                ComponentHealth::healthy_with(format!(
                    "average load {:.1}%",
                    overview.average_load_percent
                ))
            }
        }
        Err(e) => ComponentHealth::degraded(e.to_string()),
    };
    health.add_component("store_load", load);

    if let Some(stats) = &ctx.ingestion {
        let ingestion = match stats.read() {
            Ok(stats) => ComponentHealth::healthy_with(format!(
                "{} events, {:.2}% failed",
                stats.total_events,
                stats.error_rate()
            )),
            Err(_) => ComponentHealth::degraded("stats lock poisoned"),
        };
        health.add_component("ingestion", ingestion);
    }
    health
}

/// GET /health
pub async fn health(ctx: ApiContext) -> Result<Response, Infallible> {
    Ok(reply::json(&health_report(&ctx)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&DispatchError::InvalidCart("empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DispatchError::UnknownCart(CartId::new("CART-9"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DispatchError::NoEligibleStore(ProductId::new("milk"))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&DispatchError::ReservationConflict("S1/milk".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&DispatchError::LockError("poisoned".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_create_cart_request_defaults_to_instant() {
        let req: CreateCartRequest =
            serde_json::from_str(r#"{"customer_id": "C1", "area": "downtown"}"#).unwrap();
        assert_eq!(req.delivery_mode, DeliveryMode::Instant);

        let req: CreateCartRequest = serde_json::from_str(
            r#"{"customer_id": "C1", "area": "downtown",
                "delivery_mode": {"mode": "scheduled", "slot_start": "2026-10-16T18:00:00Z"}}"#,
        )
        .unwrap();
        assert!(matches!(req.delivery_mode, DeliveryMode::Scheduled { .. }));
    }
}
