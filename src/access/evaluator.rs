use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;

use super::events::AccessEvent;
use super::models::{
    AccessDecision, CountableResource, DenialReason, ResourceDelta, Subscription,
    SubscriptionStatus,
};
use super::policy::AccessPolicy;
use super::routing::{RouteMatch, Verb};
use super::usage::UsageTracker;

/// key: access-phase -> coarse subscription state used by the gates and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPhase {
    NoSubscription,
    TrialActive,
    TrialExpired,
    Active,
    Expired,
    OtherInactive,
}

impl SubscriptionPhase {
    pub fn classify(subscription: Option<&Subscription>, now: DateTime<Utc>) -> Self {
        let Some(subscription) = subscription else {
            return SubscriptionPhase::NoSubscription;
        };
        match subscription.status {
            SubscriptionStatus::PastDue | SubscriptionStatus::Cancelled => {
                SubscriptionPhase::OtherInactive
            }
            SubscriptionStatus::Expired => SubscriptionPhase::Expired,
            SubscriptionStatus::Trial | SubscriptionStatus::Active => {
                if subscription.is_trial_expired(now) {
                    SubscriptionPhase::TrialExpired
                } else if subscription.is_term_expired(now) {
                    SubscriptionPhase::Expired
                } else if subscription.in_trial() {
                    SubscriptionPhase::TrialActive
                } else {
                    SubscriptionPhase::Active
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPhase::NoSubscription => "NO_SUBSCRIPTION",
            SubscriptionPhase::TrialActive => "TRIAL_ACTIVE",
            SubscriptionPhase::TrialExpired => "TRIAL_EXPIRED",
            SubscriptionPhase::Active => "ACTIVE",
            SubscriptionPhase::Expired => "EXPIRED",
            SubscriptionPhase::OtherInactive => "OTHER_INACTIVE",
        }
    }

    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionPhase::TrialActive | SubscriptionPhase::Active)
    }
}

impl fmt::Display for SubscriptionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request descriptor handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub path: String,
    pub verb: Verb,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Overrides the units a consuming route adds (e.g. bulk bed creation).
    #[serde(default)]
    pub units: Option<u64>,
}

impl Action {
    pub fn new(verb: Verb, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            verb,
            payload: None,
            units: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_units(mut self, units: u64) -> Self {
        self.units = Some(units);
        self
    }

    fn requested_units(&self) -> Option<u64> {
        self.units
            .or_else(|| {
                self.payload
                    .as_ref()
                    .and_then(|payload| payload.get("quantity"))
                    .and_then(Value::as_u64)
            })
            .filter(|units| *units > 0)
    }
}

/// key: access-thresholds -> warning windows for events and health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessThresholds {
    pub trial_warning_days: i64,
    pub usage_warning_percent: u32,
    pub term_warning_days: i64,
}

impl Default for AccessThresholds {
    fn default() -> Self {
        Self {
            trial_warning_days: 3,
            usage_warning_percent: 80,
            term_warning_days: 7,
        }
    }
}

impl AccessThresholds {
    pub fn from_env() -> Self {
        Self {
            trial_warning_days: *config::ACCESS_TRIAL_WARNING_DAYS,
            usage_warning_percent: *config::ACCESS_USAGE_WARNING_PERCENT,
            term_warning_days: *config::ACCESS_TERM_WARNING_DAYS,
        }
    }
}

/// key: access-evaluator -> ordered gates over one subscription snapshot
///
/// Pure over its inputs: no I/O, no mutation, no events. The first gate that
/// applies decides.
#[derive(Debug, Clone)]
pub struct RestrictionEvaluator {
    policy: Arc<AccessPolicy>,
}

impl RestrictionEvaluator {
    pub fn new(policy: Arc<AccessPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn evaluate(
        &self,
        role: Option<&str>,
        subscription: Option<&Subscription>,
        action: &Action,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let matched = self.policy.routes().lookup(&action.path, action.verb);
        let rule = matched.map(|matched| matched.rule);
        let consumes = matched.and_then(|matched| consumed_by(matched, action));
        let remaining = subscription.map(|subscription| {
            UsageTracker::new(Some(subscription)).remaining_quota()
        });

        if role.map_or(false, |role| self.policy.is_privileged(role)) {
            return AccessDecision::allow(remaining, consumes);
        }
        if self.policy.is_always_allowed(action.verb, &action.path) {
            return AccessDecision::allow(remaining, consumes);
        }

        let Some(subscription) = subscription else {
            if self.policy.is_bootstrap(action.verb, &action.path) {
                return AccessDecision::allow(None, None);
            }
            return AccessDecision::deny(DenialReason::NoActiveSubscription, None);
        };

        if !subscription.status.is_entitled() {
            return AccessDecision::deny(
                DenialReason::InactiveStatus(subscription.status),
                remaining,
            );
        }
        if subscription.is_trial_expired(now) {
            return AccessDecision::deny(DenialReason::TrialExpired, remaining);
        }
        if subscription.is_term_expired(now) {
            return AccessDecision::deny(DenialReason::SubscriptionExpired, remaining);
        }

        if let Some(requirement) = rule.and_then(|rule| rule.requirement.as_ref()) {
            if !subscription.restrictions.grants(requirement) {
                return AccessDecision::deny(
                    DenialReason::InsufficientPermissions(requirement.clone()),
                    remaining,
                );
            }
        }

        if let Some(delta) = consumes {
            let tracker = UsageTracker::new(Some(subscription));
            if !tracker.can_add(delta.resource, delta.units) {
                return AccessDecision::deny(
                    DenialReason::LimitExceeded {
                        resource: delta.resource,
                        remaining: tracker.remaining(delta.resource),
                    },
                    remaining,
                );
            }
        }

        AccessDecision::allow(remaining, consumes)
    }
}

/// Only a rule matching the whole path adds resources; nested routes that fall
/// back to it (`/api/residents/:id/documents`) inherit its permission only.
fn consumed_by(matched: RouteMatch<'_>, action: &Action) -> Option<ResourceDelta> {
    if !matched.exact {
        return None;
    }
    let delta = matched.rule.consumes?;
    Some(ResourceDelta {
        resource: delta.resource,
        units: action.requested_units().unwrap_or(delta.units),
    })
}

/// Events describing a freshly applied snapshot, in publish order.
/// `restrictionsChecked` always comes last.
pub fn status_events(
    subscription: Option<&Subscription>,
    now: DateTime<Utc>,
    thresholds: &AccessThresholds,
) -> Vec<AccessEvent> {
    let phase = SubscriptionPhase::classify(subscription, now);
    let Some(subscription) = subscription else {
        return vec![
            AccessEvent::NoSubscription,
            AccessEvent::RestrictionsChecked {
                phase,
                restrictions: None,
                remaining: None,
            },
        ];
    };

    let mut events = Vec::new();
    match phase {
        SubscriptionPhase::TrialActive => {
            if let (Some(days_remaining), Some(trial_end_date)) = (
                subscription.trial_days_remaining(now),
                subscription.trial_end_date,
            ) {
                if days_remaining > 0 && days_remaining <= thresholds.trial_warning_days {
                    events.push(AccessEvent::TrialExpiringSoon {
                        days_remaining,
                        trial_end_date,
                    });
                }
            }
        }
        SubscriptionPhase::TrialExpired => events.push(AccessEvent::TrialExpired {
            trial_end_date: subscription.trial_end_date,
        }),
        SubscriptionPhase::Expired => events.push(AccessEvent::SubscriptionExpired {
            end_date: subscription.end_date,
        }),
        _ => {}
    }

    let tracker = UsageTracker::new(Some(subscription));
    for resource in CountableResource::ALL {
        if let Some(percent) = tracker.usage_percent(resource) {
            if percent >= thresholds.usage_warning_percent {
                events.push(AccessEvent::LimitWarning {
                    resource,
                    used: tracker.used(resource),
                    limit: tracker.limit(resource),
                    percent,
                });
            }
        }
    }

    events.push(AccessEvent::RestrictionsChecked {
        phase,
        restrictions: Some(subscription.restrictions.clone()),
        remaining: Some(tracker.remaining_quota()),
    });
    events
}
