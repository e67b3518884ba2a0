use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

use super::error::AccessError;
use super::evaluator::SubscriptionPhase;
use super::models::{CountableResource, RemainingQuota, Restrictions};
use super::routing::Verb;

const STREAM_CAPACITY: usize = 256;

/// key: access-events -> state changes observed by the UI toast layer and logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AccessEvent {
    Initialized {
        phase: SubscriptionPhase,
    },
    NoSubscription,
    #[serde(rename_all = "camelCase")]
    TrialExpiringSoon {
        days_remaining: i64,
        trial_end_date: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    TrialExpired {
        trial_end_date: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    SubscriptionExpired {
        end_date: Option<DateTime<Utc>>,
    },
    LimitWarning {
        resource: CountableResource,
        used: i64,
        limit: i64,
        percent: u32,
    },
    RestrictionsChecked {
        phase: SubscriptionPhase,
        restrictions: Option<Restrictions>,
        remaining: Option<RemainingQuota>,
    },
    AccessDenied {
        verb: Verb,
        path: String,
        reason: String,
    },
    Error {
        message: String,
    },
}

impl AccessEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AccessEvent::Initialized { .. } => EventKind::Initialized,
            AccessEvent::NoSubscription => EventKind::NoSubscription,
            AccessEvent::TrialExpiringSoon { .. } => EventKind::TrialExpiringSoon,
            AccessEvent::TrialExpired { .. } => EventKind::TrialExpired,
            AccessEvent::SubscriptionExpired { .. } => EventKind::SubscriptionExpired,
            AccessEvent::LimitWarning { .. } => EventKind::LimitWarning,
            AccessEvent::RestrictionsChecked { .. } => EventKind::RestrictionsChecked,
            AccessEvent::AccessDenied { .. } => EventKind::AccessDenied,
            AccessEvent::Error { .. } => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Initialized,
    NoSubscription,
    TrialExpiringSoon,
    TrialExpired,
    SubscriptionExpired,
    LimitWarning,
    RestrictionsChecked,
    AccessDenied,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Initialized,
        EventKind::NoSubscription,
        EventKind::TrialExpiringSoon,
        EventKind::TrialExpired,
        EventKind::SubscriptionExpired,
        EventKind::LimitWarning,
        EventKind::RestrictionsChecked,
        EventKind::AccessDenied,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Initialized => "initialized",
            EventKind::NoSubscription => "noSubscription",
            EventKind::TrialExpiringSoon => "trialExpiringSoon",
            EventKind::TrialExpired => "trialExpired",
            EventKind::SubscriptionExpired => "subscriptionExpired",
            EventKind::LimitWarning => "limitWarning",
            EventKind::RestrictionsChecked => "restrictionsChecked",
            EventKind::AccessDenied => "accessDenied",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the broadcast stream carries for every published event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub event: AccessEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub failed: usize,
}

type Handler = Arc<dyn Fn(&AccessEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Handler,
}

struct NotifierInner {
    tenant_id: String,
    handlers: RwLock<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<EventEnvelope>,
}

/// Typed publish/subscribe keyed by event kind.
///
/// Handlers run synchronously on the publishing thread against a snapshot of
/// the registrations, so a handler may subscribe or unsubscribe without
/// deadlocking. Each call is isolated: an `Err` or a panic is logged and the
/// remaining handlers still run.
#[derive(Clone)]
pub struct EventNotifier {
    inner: Arc<NotifierInner>,
}

impl EventNotifier {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(NotifierInner {
                tenant_id: tenant_id.into(),
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stream,
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&AccessEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        Unsubscribe {
            notifier: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    pub fn publish(&self, event: &AccessEvent) -> PublishOutcome {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .get(&kind)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| registration.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut outcome = PublishOutcome::default();
        for handler in handlers {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {
                    outcome.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };
            outcome.failed += 1;
            let failure = AccessError::HandlerFailure {
                event: kind.as_str(),
                message,
            };
            error!(tenant_id = %self.inner.tenant_id, error = %failure, "access event handler failed");
        }

        // No receivers is not an error; the stream is optional.
        let _ = self.inner.stream.send(EventEnvelope {
            id: Uuid::new_v4(),
            tenant_id: self.inner.tenant_id.clone(),
            kind,
            occurred_at: Utc::now(),
            event: event.clone(),
        });
        outcome
    }

    pub fn stream(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.stream.subscribe()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("tenant_id", &self.inner.tenant_id)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by [`EventNotifier::subscribe`]. Dropping it keeps the
/// handler registered; call [`Unsubscribe::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Unsubscribe {
    notifier: Weak<NotifierInner>,
    kind: EventKind,
    id: u64,
}

impl Unsubscribe {
    /// Returns `false` when the handler was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.notifier.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.write();
        let Some(registrations) = handlers.get_mut(&self.kind) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|registration| registration.id != self.id);
        before != registrations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(notifier: &EventNotifier, kind: EventKind) -> (Arc<AtomicUsize>, Unsubscribe) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let handle = notifier.subscribe(kind, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, handle)
    }

    #[test]
    fn publish_reaches_only_matching_kind() {
        let notifier = EventNotifier::new("tenant-a");
        let (trial_hits, _trial) = counter(&notifier, EventKind::TrialExpired);
        let (none_hits, _none) = counter(&notifier, EventKind::NoSubscription);

        let outcome = notifier.publish(&AccessEvent::NoSubscription);
        assert_eq!(outcome, PublishOutcome { delivered: 1, failed: 0 });
        assert_eq!(none_hits.load(Ordering::SeqCst), 1);
        assert_eq!(trial_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_the_rest() {
        let notifier = EventNotifier::new("tenant-a");
        let _err = notifier.subscribe(EventKind::Error, |_| Err(anyhow::anyhow!("toast layer offline")));
        let _panic = notifier.subscribe(EventKind::Error, |_| panic!("observer bug"));
        let (hits, _ok) = counter(&notifier, EventKind::Error);

        let event = AccessEvent::Error {
            message: "boom".into(),
        };
        let outcome = notifier.publish(&event);
        assert_eq!(outcome, PublishOutcome { delivered: 1, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // still usable after a handler panicked
        let outcome = notifier.publish(&event);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let notifier = EventNotifier::new("tenant-a");
        let (first_hits, first) = counter(&notifier, EventKind::NoSubscription);
        let (second_hits, _second) = counter(&notifier, EventKind::NoSubscription);
        assert_eq!(notifier.handler_count(EventKind::NoSubscription), 2);

        assert!(first.unsubscribe());
        notifier.publish(&AccessEvent::NoSubscription);
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.handler_count(EventKind::NoSubscription), 1);
    }

    #[test]
    fn unsubscribe_after_notifier_dropped_is_noop() {
        let notifier = EventNotifier::new("tenant-a");
        let (_, handle) = counter(&notifier, EventKind::Error);
        drop(notifier);
        assert!(!handle.unsubscribe());
    }

    #[test]
    fn handler_may_subscribe_while_publishing() {
        let notifier = EventNotifier::new("tenant-a");
        let inner = notifier.clone();
        let _outer = notifier.subscribe(EventKind::NoSubscription, move |_| {
            let _nested = inner.subscribe(EventKind::Error, |_| Ok(()));
            Ok(())
        });
        notifier.publish(&AccessEvent::NoSubscription);
        assert_eq!(notifier.handler_count(EventKind::Error), 1);
    }

    #[tokio::test]
    async fn stream_receives_envelopes() {
        let notifier = EventNotifier::new("tenant-a");
        let mut stream = notifier.stream();
        notifier.publish(&AccessEvent::NoSubscription);

        let envelope = stream.recv().await.unwrap();
        assert_eq!(envelope.tenant_id, "tenant-a");
        assert_eq!(envelope.kind, EventKind::NoSubscription);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "noSubscription");
        assert_eq!(json["event"]["type"], "noSubscription");
    }

    #[test]
    fn event_payload_uses_camel_case() {
        let event = AccessEvent::TrialExpiringSoon {
            days_remaining: 2,
            trial_end_date: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "trialExpiringSoon");
        assert_eq!(json["daysRemaining"], 2);
        assert_eq!(event.kind().as_str(), "trialExpiringSoon");
    }
}
