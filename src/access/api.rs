use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::extractor::TenantSession;

use super::evaluator::{Action, SubscriptionPhase};
use super::health::HealthReport;
use super::models::{AccessDecision, CountableResource, Subscription};
use super::refresh::{ensure_initialized, refresh_tenant};
use super::session::{TenantAccess, TenantRegistry};
use super::source::SubscriptionSource;
use super::usage::{ResourceUsage, UsageTracker};

type SourceExtension = Option<Extension<Arc<dyn SubscriptionSource>>>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub tenant_id: String,
    pub phase: SubscriptionPhase,
    pub initialized: bool,
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Serialize)]
pub struct PushedSubscription {
    pub persisted: bool,
    #[serde(flatten)]
    pub view: SubscriptionView,
}

impl SubscriptionView {
    fn of(access: &TenantAccess) -> Self {
        let snapshot = access.snapshot();
        let now = Utc::now();
        Self {
            tenant_id: access.tenant_id().to_string(),
            phase: SubscriptionPhase::classify(snapshot.subscription.as_deref(), now),
            initialized: snapshot.initialized,
            revision: snapshot.revision,
            applied_at: snapshot.applied_at,
            subscription: snapshot.subscription.as_deref().cloned(),
        }
    }
}

async fn loaded(
    registry: &TenantRegistry,
    source: SourceExtension,
    session: &TenantSession,
) -> Arc<TenantAccess> {
    let access = registry.get_or_create(&session.tenant_id);
    let source = source.map(|Extension(source)| source);
    ensure_initialized(&access, source.as_deref()).await;
    access
}

/// key: access-api -> decision for an action the frontend is about to send
/// Does not notify `accessDenied` observers; the gate middleware does that.
pub async fn evaluate(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
    Json(action): Json<Action>,
) -> AppResult<Json<AccessDecision>> {
    let access = loaded(&registry, source, &session).await;
    Ok(Json(access.evaluate(Some(&session.role), &action)))
}

pub async fn remaining(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
    Path(resource): Path<String>,
) -> AppResult<Json<ResourceUsage>> {
    let resource: CountableResource = resource.parse().map_err(AppError::BadRequest)?;
    let access = loaded(&registry, source, &session).await;
    let subscription = access.get();
    Ok(Json(UsageTracker::new(subscription.as_deref()).snapshot(resource)))
}

pub async fn health(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
) -> AppResult<Json<HealthReport>> {
    let access = loaded(&registry, source, &session).await;
    Ok(Json(access.health_report()))
}

pub async fn current_subscription(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
) -> AppResult<Json<SubscriptionView>> {
    let access = loaded(&registry, source, &session).await;
    Ok(Json(SubscriptionView::of(&access)))
}

/// Forces a re-read from the configured source.
pub async fn refresh(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
) -> AppResult<Json<SubscriptionView>> {
    let Some(Extension(source)) = source else {
        return Err(AppError::BadRequest(
            "no subscription source configured".to_string(),
        ));
    };
    let access = registry.get_or_create(&session.tenant_id);
    refresh_tenant(&access, source.as_ref(), Utc::now()).await?;
    Ok(Json(SubscriptionView::of(&access)))
}

/// Logout: drops the cached record so the next request starts clean.
pub async fn clear(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    session: TenantSession,
) -> StatusCode {
    if let Some(access) = registry.get(&session.tenant_id) {
        access.clear();
    }
    StatusCode::NO_CONTENT
}

/// Billing pushes a fresh record for any tenant. Privileged roles only.
/// With a writable source the record is stored there first, so the next poll
/// returns it instead of the previous one.
pub async fn push_subscription(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    source: SourceExtension,
    session: TenantSession,
    Path(tenant_id): Path<String>,
    Json(payload): Json<Value>,
) -> AppResult<Json<PushedSubscription>> {
    if !registry.evaluator().policy().is_privileged(&session.role) {
        return Err(AppError::Forbidden);
    }
    // validate up front so a bad push is rejected instead of wiping the tenant
    let subscription = Subscription::from_payload(&payload)?;
    let persisted = match source {
        Some(Extension(source)) => source.persist(&tenant_id, subscription.as_ref()).await?,
        None => false,
    };
    let access = registry.get_or_create(&tenant_id);
    access.update(subscription);
    Ok(Json(PushedSubscription {
        persisted,
        view: SubscriptionView::of(&access),
    }))
}
