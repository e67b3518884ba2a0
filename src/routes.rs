use axum::{
    routing::{get, post, put},
    Router,
};

use crate::access::api;

/// Query and admin endpoints; they are not gated themselves. Services embedding
/// the crate put `access::subscription_gate` in front of their tenant routes.
pub fn api_routes() -> Router {
    Router::new()
        .route("/api/access/evaluate", post(api::evaluate))
        .route("/api/access/remaining/:resource", get(api::remaining))
        .route("/api/access/health", get(api::health))
        .route(
            "/api/access/subscription",
            get(api::current_subscription).delete(api::clear),
        )
        .route("/api/access/refresh", post(api::refresh))
        .route(
            "/api/access/tenants/:tenant_id/subscription",
            put(api::push_subscription),
        )
}
