use serde::Serialize;

use super::models::{CountableResource, RemainingQuota, Subscription};

/// key: access-usage -> remaining capacity against plan maximums
/// A missing maximum counts as zero so unknown plans cannot grow.
#[derive(Debug, Clone, Copy)]
pub struct UsageTracker<'a> {
    subscription: Option<&'a Subscription>,
}

impl<'a> UsageTracker<'a> {
    pub fn new(subscription: Option<&'a Subscription>) -> Self {
        Self { subscription }
    }

    pub fn limit(&self, resource: CountableResource) -> i64 {
        self.subscription
            .and_then(|subscription| subscription.restrictions.limit(resource))
            .unwrap_or(0)
            .max(0)
    }

    pub fn used(&self, resource: CountableResource) -> i64 {
        self.subscription
            .and_then(|subscription| subscription.usage.used(resource))
            .unwrap_or(0)
            .max(0)
    }

    pub fn remaining(&self, resource: CountableResource) -> u64 {
        let remaining = self.limit(resource).saturating_sub(self.used(resource));
        u64::try_from(remaining).unwrap_or(0)
    }

    pub fn can_add(&self, resource: CountableResource, units: u64) -> bool {
        units <= self.remaining(resource)
    }

    /// `None` when the plan allows none of the resource.
    pub fn usage_percent(&self, resource: CountableResource) -> Option<u32> {
        let limit = self.limit(resource);
        if limit == 0 {
            return None;
        }
        let percent = self.used(resource).saturating_mul(100) / limit;
        Some(u32::try_from(percent).unwrap_or(u32::MAX))
    }

    pub fn remaining_quota(&self) -> RemainingQuota {
        RemainingQuota {
            beds: self.remaining(CountableResource::Beds),
            branches: self.remaining(CountableResource::Branches),
        }
    }

    pub fn snapshot(&self, resource: CountableResource) -> ResourceUsage {
        ResourceUsage {
            resource,
            used: self.used(resource),
            limit: self.limit(resource),
            remaining: self.remaining(resource),
            percent: self.usage_percent(resource),
        }
    }

    pub fn snapshots(&self) -> Vec<ResourceUsage> {
        CountableResource::ALL
            .iter()
            .map(|resource| self.snapshot(*resource))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub resource: CountableResource,
    pub used: i64,
    pub limit: i64,
    pub remaining: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::models::{Restrictions, SubscriptionStatus, Usage};

    fn subscription(max_beds: Option<i64>, beds_used: Option<i64>) -> Subscription {
        Subscription {
            status: SubscriptionStatus::Active,
            plan_id: Some("starter".into()),
            is_trial_active: false,
            trial_end_date: None,
            end_date: None,
            restrictions: Restrictions {
                max_beds,
                max_branches: Some(1),
                ..Restrictions::default()
            },
            usage: Usage {
                beds_used,
                branches_used: Some(1),
            },
        }
    }

    #[test]
    fn remaining_is_limit_minus_used() {
        let subscription = subscription(Some(10), Some(9));
        let tracker = UsageTracker::new(Some(&subscription));
        assert_eq!(tracker.remaining(CountableResource::Beds), 1);
        assert!(tracker.can_add(CountableResource::Beds, 1));
        assert!(!tracker.can_add(CountableResource::Beds, 2));
        assert_eq!(tracker.remaining(CountableResource::Branches), 0);
        assert!(!tracker.can_add(CountableResource::Branches, 1));
    }

    #[test]
    fn over_usage_clamps_to_zero() {
        let subscription = subscription(Some(5), Some(8));
        let tracker = UsageTracker::new(Some(&subscription));
        assert_eq!(tracker.remaining(CountableResource::Beds), 0);
        assert_eq!(tracker.usage_percent(CountableResource::Beds), Some(160));
    }

    #[test]
    fn missing_limit_counts_as_zero() {
        let subscription = subscription(None, None);
        let tracker = UsageTracker::new(Some(&subscription));
        assert_eq!(tracker.limit(CountableResource::Beds), 0);
        assert!(!tracker.can_add(CountableResource::Beds, 1));
        assert!(tracker.can_add(CountableResource::Beds, 0));
        assert_eq!(tracker.usage_percent(CountableResource::Beds), None);
    }

    #[test]
    fn no_subscription_has_no_quota() {
        let tracker = UsageTracker::new(None);
        assert_eq!(tracker.remaining_quota(), RemainingQuota::default());
    }

    #[test]
    fn snapshot_reports_percent() {
        let subscription = subscription(Some(20), Some(16));
        let usage = UsageTracker::new(Some(&subscription)).snapshot(CountableResource::Beds);
        assert_eq!(usage.used, 16);
        assert_eq!(usage.remaining, 4);
        assert_eq!(usage.percent, Some(80));
    }
}
