use tracing::{debug, error, info, warn};

use crate::access::{AccessEvent, EventKind, EventNotifier, Unsubscribe};

/// Subscribes a structured-logging observer to every access event kind of one tenant.
pub fn attach_event_logging(tenant_id: &str, notifier: &EventNotifier) -> Vec<Unsubscribe> {
    EventKind::ALL
        .iter()
        .map(|kind| {
            let tenant_id = tenant_id.to_string();
            notifier.subscribe(*kind, move |event| {
                log_event(&tenant_id, event);
                Ok(())
            })
        })
        .collect()
}

fn log_event(tenant_id: &str, event: &AccessEvent) {
    match event {
        AccessEvent::TrialExpiringSoon {
            days_remaining,
            trial_end_date,
        } => warn!(
            tenant_id,
            days_remaining,
            trial_end_date = %trial_end_date,
            "trial expiring soon"
        ),
        AccessEvent::TrialExpired { .. } => warn!(tenant_id, "trial expired"),
        AccessEvent::SubscriptionExpired { .. } => warn!(tenant_id, "subscription expired"),
        AccessEvent::LimitWarning {
            resource,
            used,
            limit,
            percent,
        } => warn!(
            tenant_id,
            resource = resource.as_str(),
            used,
            limit,
            percent,
            "plan limit nearly reached"
        ),
        AccessEvent::Error { message } => error!(tenant_id, error = %message, "access state error"),
        AccessEvent::AccessDenied { verb, path, reason } => info!(
            tenant_id,
            verb = verb.as_str(),
            path = %path,
            reason = %reason,
            "access denied"
        ),
        other => debug!(tenant_id, event = other.kind().as_str(), "access event"),
    }
}
