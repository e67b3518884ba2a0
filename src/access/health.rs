use chrono::{DateTime, Utc};
use serde::Serialize;

use super::evaluator::{AccessThresholds, SubscriptionPhase};
use super::models::{CountableResource, Subscription};
use super::usage::{ResourceUsage, UsageTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    pub severity: Severity,
    pub message: String,
}

impl HealthIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            message: message.into(),
        }
    }
}

/// key: access-health -> derived view over a snapshot at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub phase: SubscriptionPhase,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    pub usage: Vec<ResourceUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_days_remaining: Option<i64>,
    pub generated_at: DateTime<Utc>,
}

pub fn health_report(
    subscription: Option<&Subscription>,
    now: DateTime<Utc>,
    thresholds: &AccessThresholds,
) -> HealthReport {
    let phase = SubscriptionPhase::classify(subscription, now);
    let tracker = UsageTracker::new(subscription);
    let mut issues = Vec::new();

    match (phase, subscription) {
        (SubscriptionPhase::NoSubscription, _) | (_, None) => {
            issues.push(HealthIssue::critical("No active subscription"));
        }
        (SubscriptionPhase::OtherInactive, Some(subscription)) => {
            issues.push(HealthIssue::critical(format!(
                "Subscription is {}",
                subscription.status
            )));
        }
        (SubscriptionPhase::TrialExpired, _) => {
            issues.push(HealthIssue::critical("Trial period has expired"));
        }
        (SubscriptionPhase::Expired, _) => {
            issues.push(HealthIssue::critical("Subscription has expired"));
        }
        (SubscriptionPhase::TrialActive, Some(subscription)) => {
            if let Some(days) = subscription.trial_days_remaining(now) {
                if days <= thresholds.trial_warning_days {
                    issues.push(HealthIssue::warning(format!(
                        "Trial ends in {days} day{}",
                        plural(days)
                    )));
                }
            }
        }
        (SubscriptionPhase::Active, Some(subscription)) => {
            if let Some(days) = subscription.term_days_remaining(now) {
                if days <= thresholds.term_warning_days {
                    issues.push(HealthIssue::warning(format!(
                        "Subscription renews or ends in {days} day{}",
                        plural(days)
                    )));
                }
            }
        }
    }

    if subscription.is_some() {
        for resource in CountableResource::ALL {
            issues.extend(usage_issue(&tracker, resource, thresholds));
        }
    }

    let healthy = issues
        .iter()
        .all(|issue| issue.severity != Severity::Critical);
    HealthReport {
        phase,
        healthy,
        issues,
        usage: tracker.snapshots(),
        trial_days_remaining: subscription.and_then(|subscription| subscription.trial_days_remaining(now)),
        generated_at: now,
    }
}

fn usage_issue(
    tracker: &UsageTracker<'_>,
    resource: CountableResource,
    thresholds: &AccessThresholds,
) -> Option<HealthIssue> {
    let percent = tracker.usage_percent(resource)?;
    if percent >= 100 {
        Some(HealthIssue::critical(format!(
            "{} limit reached ({}/{})",
            resource.label(),
            tracker.used(resource),
            tracker.limit(resource)
        )))
    } else if percent >= thresholds.usage_warning_percent {
        Some(HealthIssue::warning(format!(
            "{} usage at {percent}% of plan limit",
            resource.label()
        )))
    } else {
        None
    }
}

fn plural(days: i64) -> &'static str {
    if days == 1 {
        ""
    } else {
        "s"
    }
}
