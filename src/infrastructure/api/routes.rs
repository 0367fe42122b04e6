use super::handlers::{self, error_reply, ApiContext};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use tracing::debug;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 64 * 1024;

fn with_ctx(ctx: ApiContext) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Every route, with rejections rendered as JSON errors
pub fn routes(ctx: ApiContext) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let create_cart = warp::path!("carts")
        .and(warp::post())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::create_cart);

    let add_item = warp::path!("carts" / String / "items")
        .and(warp::post())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::add_cart_item);

    let get_cart = warp::path!("carts" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_cart);

    let assign = warp::path!("carts" / String / "assign")
        .and(warp::post())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::assign_cart);

    let status = warp::path!("suborders" / String / "status")
        .and(warp::patch())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::update_sub_order_status);

    let order = warp::path!("orders" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_order);

    let overview = warp::path!("stores" / "load")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::load_overview);

    let store_load = warp::path!("stores" / String / "load")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::store_load);

    let demand = warp::path!("demand" / String / String)
        .and(warp::get())
        .and(warp::query::<handlers::DemandQuery>())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::demand);

    let riders = warp::path!("riders")
        .and(warp::post())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::register_rider);

    let events = warp::path!("events")
        .and(warp::post())
        .and(json_body())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::submit_event);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::metrics);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_ctx(ctx))
        .and_then(handlers::health);

    create_cart
        .or(add_item)
        .or(get_cart)
        .or(assign)
        .or(status)
        .or(order)
        .or(overview)
        .or(store_load)
        .or(demand)
        .or(riders)
        .or(events)
        .or(metrics)
        .or(health)
        .with(warp::cors().allow_any_origin())
        .recover(handle_rejection)
}

/// Renders warp rejections in the same JSON shape as engine errors
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let reply = if err.is_not_found() {
        error_reply(StatusCode::NOT_FOUND, "not_found", "no such route")
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        error_reply(StatusCode::BAD_REQUEST, "invalid_body", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        error_reply(StatusCode::BAD_REQUEST, "invalid_query", e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        error_reply(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "body too large")
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        error_reply(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "expected application/json",
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        error_reply(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed")
    } else {
        debug!("Unhandled rejection: {:?}", err);
        error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal", "unhandled rejection")
    };
    Ok(reply)
}
