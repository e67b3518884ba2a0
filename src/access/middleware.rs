use std::sync::Arc;

use axum::{
    extract::Extension,
    http::Request,
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use crate::error::AppError;
use crate::extractor::TenantSession;

use super::evaluator::Action;
use super::refresh::ensure_initialized;
use super::routing::Verb;
use super::session::TenantRegistry;
use super::source::SubscriptionSource;

/// key: access-gate -> backend check in front of tenant routes
///
/// Layer with `axum::middleware::from_fn` on the routes of the embedding
/// service; the binary's own `/api/access/*` routes are not gated. Needs
/// `Extension<Arc<TenantRegistry>>`; an `Extension<Arc<dyn SubscriptionSource>>`
/// enables loading a tenant on its first request.
///
/// Units a consuming action adds are reserved before the handler runs and
/// handed back when it does not answer 2xx. Methods outside the known verbs
/// are rejected with 400.
pub async fn subscription_gate<B>(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: Option<Extension<Arc<dyn SubscriptionSource>>>,
    session: Option<TenantSession>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    let verb = request
        .method()
        .as_str()
        .parse::<Verb>()
        .map_err(AppError::BadRequest)?;
    let action = Action::new(verb, request.uri().path());

    let Some(session) = session else {
        let decision = registry.evaluate_anonymous(&action, Utc::now());
        if !decision.allowed {
            return Err(AppError::Unauthorized);
        }
        return Ok(next.run(request).await);
    };

    let access = registry.get_or_create(&session.tenant_id);
    let source = source.map(|Extension(source)| source);
    ensure_initialized(&access, source.as_deref()).await;

    let reservation = access.admit(Some(&session.role), &action)?;
    let response = next.run(request).await;
    if let Some(reservation) = reservation {
        if !response.status().is_success() {
            access.release(reservation);
        }
    }
    Ok(response)
}
