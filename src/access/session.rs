use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::telemetry;

use super::error::AccessError;
use super::evaluator::{status_events, AccessThresholds, Action, RestrictionEvaluator, SubscriptionPhase};
use super::events::{AccessEvent, EventNotifier};
use super::health::{health_report, HealthReport};
use super::models::{AccessDecision, CountableResource, DenialReason, RemainingQuota, Subscription};
use super::policy::AccessPolicy;
use super::state::{Reservation, StateSnapshot, SubscriptionState};
use super::usage::UsageTracker;

/// key: access-session -> one tenant's state holder, notifier and evaluator
pub struct TenantAccess {
    tenant_id: String,
    state: SubscriptionState,
    notifier: EventNotifier,
    evaluator: RestrictionEvaluator,
    thresholds: AccessThresholds,
}

impl TenantAccess {
    pub fn new(
        tenant_id: impl Into<String>,
        evaluator: RestrictionEvaluator,
        thresholds: AccessThresholds,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            notifier: EventNotifier::new(tenant_id.clone()),
            tenant_id,
            state: SubscriptionState::new(),
            evaluator,
            thresholds,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Seeds the state from an authentication response. A malformed payload
    /// leaves the tenant without a subscription and publishes an `error` event.
    pub fn initialize(&self, payload: &Value) -> SubscriptionPhase {
        self.initialize_at(payload, Utc::now())
    }

    pub fn initialize_at(&self, payload: &Value, now: DateTime<Utc>) -> SubscriptionPhase {
        let subscription = self.decode(payload);
        let revision = self.state.replace(subscription, now);
        let current = self.state.get();
        let phase = SubscriptionPhase::classify(current.as_deref(), now);
        info!(tenant_id = %self.tenant_id, revision, phase = %phase, "subscription state initialized");
        self.notifier.publish(&AccessEvent::Initialized { phase });
        self.publish_status(current.as_deref(), now);
        phase
    }

    /// Installs a freshly fetched record and re-runs the status check.
    pub fn update(&self, subscription: Option<Subscription>) -> u64 {
        self.update_at(subscription, Utc::now())
    }

    pub fn update_at(&self, subscription: Option<Subscription>, now: DateTime<Utc>) -> u64 {
        let subscription = match subscription {
            Some(subscription) => match subscription.validate() {
                Ok(()) => Some(subscription),
                Err(err) => {
                    self.report_malformed(&err);
                    None
                }
            },
            None => None,
        };
        self.apply(subscription, now)
    }

    pub fn update_payload(&self, payload: &Value) -> u64 {
        self.update_payload_at(payload, Utc::now())
    }

    pub fn update_payload_at(&self, payload: &Value, now: DateTime<Utc>) -> u64 {
        let subscription = self.decode(payload);
        self.apply(subscription, now)
    }

    pub fn get(&self) -> Option<Arc<Subscription>> {
        self.state.get()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    pub fn clear(&self) {
        self.state.clear();
        debug!(tenant_id = %self.tenant_id, "subscription state cleared");
    }

    pub fn evaluate(&self, role: Option<&str>, action: &Action) -> AccessDecision {
        self.evaluate_at(role, action, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        role: Option<&str>,
        action: &Action,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let subscription = self.state.get();
        self.evaluator
            .evaluate(role, subscription.as_deref(), action, now)
    }

    /// Like [`TenantAccess::evaluate`] but turns a denial into
    /// `AccessError::AccessDenied` after notifying `accessDenied` observers.
    pub fn authorize(&self, role: Option<&str>, action: &Action) -> Result<AccessDecision, AccessError> {
        self.authorize_at(role, action, Utc::now())
    }

    pub fn authorize_at(
        &self,
        role: Option<&str>,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, AccessError> {
        let decision = self.evaluate_at(role, action, now);
        if let Some(reason) = &decision.denial {
            self.notify_denied(action, reason);
        }
        decision.into_result()
    }

    /// Authorizes `action` and charges the units it adds before the caller runs
    /// it. The limit is checked again under the state lock, so concurrent
    /// requests cannot push usage past the plan. Hand the reservation back with
    /// [`TenantAccess::release`] when the action fails.
    pub fn admit(&self, role: Option<&str>, action: &Action) -> Result<Option<Reservation>, AccessError> {
        self.admit_at(role, action, Utc::now())
    }

    pub fn admit_at(
        &self,
        role: Option<&str>,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, AccessError> {
        let decision = self.authorize_at(role, action, now)?;
        let Some(delta) = decision.consumes else {
            return Ok(None);
        };

        let policy = self.evaluator.policy();
        let unlimited = role.map_or(false, |role| policy.is_privileged(role))
            || policy.is_always_allowed(action.verb, &action.path);
        if unlimited {
            return Ok(self.state.charge(delta));
        }

        match self.state.try_reserve(delta) {
            Some(reservation) => {
                debug!(
                    tenant_id = %self.tenant_id,
                    resource = delta.resource.as_str(),
                    units = delta.units,
                    "usage reserved"
                );
                Ok(Some(reservation))
            }
            None => {
                let reason = DenialReason::LimitExceeded {
                    resource: delta.resource,
                    remaining: self.remaining(delta.resource),
                };
                self.notify_denied(action, &reason);
                Err(AccessError::AccessDenied(reason))
            }
        }
    }

    pub fn release(&self, reservation: Reservation) -> bool {
        let released = self.state.release(reservation);
        debug!(
            tenant_id = %self.tenant_id,
            resource = reservation.delta.resource.as_str(),
            units = reservation.delta.units,
            released,
            "usage reservation returned"
        );
        released
    }

    pub fn remaining(&self, resource: CountableResource) -> u64 {
        let subscription = self.state.get();
        UsageTracker::new(subscription.as_deref()).remaining(resource)
    }

    pub fn remaining_quota(&self) -> RemainingQuota {
        let subscription = self.state.get();
        UsageTracker::new(subscription.as_deref()).remaining_quota()
    }

    pub fn can_add(&self, resource: CountableResource, units: u64) -> bool {
        let subscription = self.state.get();
        UsageTracker::new(subscription.as_deref()).can_add(resource, units)
    }

    pub fn health_report(&self) -> HealthReport {
        self.health_report_at(Utc::now())
    }

    pub fn health_report_at(&self, now: DateTime<Utc>) -> HealthReport {
        let subscription = self.state.get();
        health_report(subscription.as_deref(), now, &self.thresholds)
    }

    fn apply(&self, subscription: Option<Subscription>, now: DateTime<Utc>) -> u64 {
        let revision = self.state.replace(subscription, now);
        let current = self.state.get();
        debug!(
            tenant_id = %self.tenant_id,
            revision,
            phase = %SubscriptionPhase::classify(current.as_deref(), now),
            "subscription snapshot applied"
        );
        self.publish_status(current.as_deref(), now);
        revision
    }

    fn notify_denied(&self, action: &Action, reason: &DenialReason) {
        self.notifier.publish(&AccessEvent::AccessDenied {
            verb: action.verb,
            path: action.path.clone(),
            reason: reason.to_string(),
        });
    }

    fn publish_status(&self, subscription: Option<&Subscription>, now: DateTime<Utc>) {
        for event in status_events(subscription, now, &self.thresholds) {
            self.notifier.publish(&event);
        }
    }

    fn decode(&self, payload: &Value) -> Option<Subscription> {
        match Subscription::from_payload(payload) {
            Ok(subscription) => subscription,
            Err(err) => {
                self.report_malformed(&err);
                None
            }
        }
    }

    fn report_malformed(&self, err: &AccessError) {
        warn!(
            tenant_id = %self.tenant_id,
            error = %err,
            "treating tenant as unsubscribed"
        );
        self.notifier.publish(&AccessEvent::Error {
            message: err.to_string(),
        });
    }
}

/// key: access-registry -> tenant id -> TenantAccess, created on first use
pub struct TenantRegistry {
    evaluator: RestrictionEvaluator,
    thresholds: AccessThresholds,
    tenants: DashMap<String, Arc<TenantAccess>>,
}

impl TenantRegistry {
    pub fn new(policy: Arc<AccessPolicy>, thresholds: AccessThresholds) -> Self {
        Self {
            evaluator: RestrictionEvaluator::new(policy),
            thresholds,
            tenants: DashMap::new(),
        }
    }

    pub fn evaluator(&self) -> &RestrictionEvaluator {
        &self.evaluator
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantAccess>> {
        self.tenants.get(tenant_id).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, tenant_id: &str) -> Arc<TenantAccess> {
        if let Some(existing) = self.get(tenant_id) {
            return existing;
        }
        self.tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                let access = Arc::new(TenantAccess::new(
                    tenant_id,
                    self.evaluator.clone(),
                    self.thresholds,
                ));
                telemetry::attach_event_logging(tenant_id, access.notifier());
                debug!(tenant_id, "tenant access context created");
                access
            })
            .value()
            .clone()
    }

    /// Drops the tenant's context (logout of the last session).
    pub fn remove(&self, tenant_id: &str) -> Option<Arc<TenantAccess>> {
        let (_, access) = self.tenants.remove(tenant_id)?;
        access.clear();
        Some(access)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Decision for a caller without a tenant session.
    pub fn evaluate_anonymous(&self, action: &Action, now: DateTime<Utc>) -> AccessDecision {
        self.evaluator.evaluate(None, None, action, now)
    }
}
