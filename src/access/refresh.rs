use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::session::{TenantAccess, TenantRegistry};
use super::source::{SourceError, SubscriptionSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

/// Fetches one tenant's record and applies it. On failure the previous
/// snapshot stays in place.
pub async fn refresh_tenant(
    access: &TenantAccess,
    source: &dyn SubscriptionSource,
    now: DateTime<Utc>,
) -> Result<u64, SourceError> {
    let payload = source.fetch(access.tenant_id()).await?;
    let revision = match payload {
        Some(payload) => access.update_payload_at(&payload, now),
        None => access.update_at(None, now),
    };
    debug!(
        tenant_id = access.tenant_id(),
        source = source.name(),
        revision,
        "subscription refreshed"
    );
    Ok(revision)
}

/// First request of a tenant seen since startup: load its record before the
/// gate runs. Without a source, or when the fetch fails, the context stays
/// uninitialized and is evaluated as having no subscription.
pub async fn ensure_initialized(
    access: &TenantAccess,
    source: Option<&dyn SubscriptionSource>,
) {
    if access.is_initialized() {
        return;
    }
    let Some(source) = source else {
        return;
    };
    if let Err(err) = refresh_tenant(access, source, Utc::now()).await {
        warn!(
            tenant_id = access.tenant_id(),
            source = source.name(),
            error = %err,
            "initial subscription load failed"
        );
    }
}

/// key: access-refresh-poller -> tick handler
pub async fn process_tick(
    registry: &TenantRegistry,
    source: &dyn SubscriptionSource,
    now: DateTime<Utc>,
) -> RefreshSummary {
    let mut summary = RefreshSummary::default();
    for tenant_id in registry.tenant_ids() {
        // removed between listing and refresh
        let Some(access) = registry.get(&tenant_id) else {
            continue;
        };
        match refresh_tenant(&access, source, now).await {
            Ok(_) => summary.refreshed += 1,
            Err(err) => {
                summary.failed += 1;
                warn!(
                    tenant_id = %tenant_id,
                    source = source.name(),
                    error = %err,
                    "subscription refresh failed; keeping last known snapshot"
                );
            }
        }
    }
    summary
}

/// key: access-refresh-poller -> periodic re-read of every registered tenant
pub fn spawn(
    registry: Arc<TenantRegistry>,
    source: Arc<dyn SubscriptionSource>,
    interval: Duration,
) -> JoinHandle<()> {
    info!(
        source = source.name(),
        interval_secs = interval.as_secs(),
        "subscription refresh poller started"
    );
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let summary = process_tick(&registry, source.as_ref(), Utc::now()).await;
            if summary.refreshed + summary.failed > 0 {
                debug!(
                    refreshed = summary.refreshed,
                    failed = summary.failed,
                    "subscription refresh tick finished"
                );
            }
        }
    })
}
