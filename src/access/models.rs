use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::error::AccessError;
use super::routing::Verb;

const SECONDS_PER_DAY: i64 = 86_400;

/// key: access-subscription-model -> tenant entitlement snapshot
/// Mirrors the JSON record returned by the auth response and the billing backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub is_trial_active: bool,
    #[serde(default)]
    pub trial_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub usage: Usage,
}

impl Subscription {
    /// Decodes either a bare subscription record or an auth response carrying a
    /// `subscription` field. A `null` subscription means the tenant has none.
    pub fn from_payload(payload: &Value) -> Result<Option<Self>, AccessError> {
        let body = payload.get("subscription").unwrap_or(payload);
        if body.is_null() {
            return Ok(None);
        }
        let subscription: Subscription = serde_json::from_value(body.clone())
            .map_err(|err| AccessError::MalformedSubscriptionPayload(err.to_string()))?;
        subscription.validate()?;
        Ok(Some(subscription))
    }

    pub fn validate(&self) -> Result<(), AccessError> {
        if self.status == SubscriptionStatus::Trial && self.trial_end_date.is_none() {
            return Err(malformed("trial subscription without trialEndDate"));
        }
        if self.is_trial_active && self.trial_end_date.is_none() {
            return Err(malformed("isTrialActive set without trialEndDate"));
        }
        for resource in CountableResource::ALL {
            if self.restrictions.limit(resource).map_or(false, |max| max < 0) {
                return Err(malformed(format!("negative {} limit", resource.as_str())));
            }
            if self.usage.used(resource).map_or(false, |used| used < 0) {
                return Err(malformed(format!("negative {} usage", resource.as_str())));
            }
        }
        Ok(())
    }

    /// A `trial` status counts as a running trial even when `isTrialActive` is absent.
    pub fn in_trial(&self) -> bool {
        self.is_trial_active || self.status == SubscriptionStatus::Trial
    }

    pub fn is_trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.in_trial() && self.trial_end_date.map_or(false, |end| end <= now)
    }

    pub fn is_term_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date.map_or(false, |end| end <= now)
    }

    /// Whole days left in the trial, rounded up. `None` outside a trial.
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.in_trial() {
            return None;
        }
        self.trial_end_date.map(|end| days_until(end, now))
    }

    pub fn term_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_date.map(|end| days_until(end, now))
    }
}

fn malformed(message: impl Into<String>) -> AccessError {
    AccessError::MalformedSubscriptionPayload(message.into())
}

/// Rounds partial days up so a deadline 47h away reads as 2 days.
pub fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (deadline - now).num_seconds();
    if seconds <= 0 {
        return seconds.div_euclid(SECONDS_PER_DAY);
    }
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[serde(alias = "trialing")]
    Trial,
    Active,
    #[serde(alias = "pastDue", alias = "past-due")]
    PastDue,
    Expired,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that may pass the status gate.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: access-restrictions -> plan limits and module grants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    #[serde(default)]
    pub max_beds: Option<i64>,
    #[serde(default)]
    pub max_branches: Option<i64>,
    #[serde(default)]
    pub modules: BTreeSet<ModuleGrant>,
    #[serde(default)]
    pub features: BTreeSet<ModuleGrant>,
}

impl Restrictions {
    pub fn limit(&self, resource: CountableResource) -> Option<i64> {
        match resource {
            CountableResource::Beds => self.max_beds,
            CountableResource::Branches => self.max_branches,
        }
    }

    pub fn grants(&self, requirement: &PermissionRequirement) -> bool {
        self.modules
            .iter()
            .chain(self.features.iter())
            .any(|grant| grant.covers(requirement))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub beds_used: Option<i64>,
    #[serde(default)]
    pub branches_used: Option<i64>,
}

impl Usage {
    pub fn used(&self, resource: CountableResource) -> Option<i64> {
        match resource {
            CountableResource::Beds => self.beds_used,
            CountableResource::Branches => self.branches_used,
        }
    }

    pub fn add(&mut self, resource: CountableResource, units: u64) {
        let slot = match resource {
            CountableResource::Beds => &mut self.beds_used,
            CountableResource::Branches => &mut self.branches_used,
        };
        let delta = i64::try_from(units).unwrap_or(i64::MAX);
        *slot = Some(slot.unwrap_or(0).saturating_add(delta));
    }

    /// Inverse of [`Usage::add`]; never goes below zero.
    pub fn remove(&mut self, resource: CountableResource, units: u64) {
        let slot = match resource {
            CountableResource::Beds => &mut self.beds_used,
            CountableResource::Branches => &mut self.branches_used,
        };
        if let Some(used) = slot {
            let delta = i64::try_from(units).unwrap_or(i64::MAX);
            *used = used.saturating_sub(delta).max(0);
        }
    }
}

/// Resources counted against plan maximums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountableResource {
    Beds,
    Branches,
}

impl CountableResource {
    pub const ALL: [CountableResource; 2] = [CountableResource::Beds, CountableResource::Branches];

    pub fn as_str(&self) -> &'static str {
        match self {
            CountableResource::Beds => "beds",
            CountableResource::Branches => "branches",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CountableResource::Beds => "Bed",
            CountableResource::Branches => "Branch",
        }
    }
}

impl fmt::Display for CountableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountableResource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beds" | "bed" => Ok(CountableResource::Beds),
            "branches" | "branch" => Ok(CountableResource::Branches),
            other => Err(format!("unknown countable resource `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Create,
    Update,
    Delete,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Read => "read",
            PermissionKind::Create => "create",
            PermissionKind::Update => "update",
            PermissionKind::Delete => "delete",
        }
    }

    /// Permission implied by a verb when a route does not name one.
    pub fn for_verb(verb: Verb) -> Self {
        match verb {
            Verb::Post => PermissionKind::Create,
            Verb::Put | Verb::Patch => PermissionKind::Update,
            Verb::Delete => PermissionKind::Delete,
            _ => PermissionKind::Read,
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionKind {
    type Err = GrantParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "view" => Ok(PermissionKind::Read),
            "create" => Ok(PermissionKind::Create),
            "update" | "edit" => Ok(PermissionKind::Update),
            "delete" => Ok(PermissionKind::Delete),
            other => Err(GrantParseError(format!("unknown permission `{other}`"))),
        }
    }
}

/// key: access-permission-requirement -> module/submodule/permission triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRequirement {
    pub module: String,
    pub submodule: String,
    pub permission: PermissionKind,
}

impl PermissionRequirement {
    pub fn new(
        module: impl Into<String>,
        submodule: impl Into<String>,
        permission: PermissionKind,
    ) -> Self {
        Self {
            module: module.into(),
            submodule: submodule.into(),
            permission,
        }
    }
}

impl fmt::Display for PermissionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.module, self.submodule, self.permission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid module grant: {0}")]
pub struct GrantParseError(pub String);

/// Entry of `restrictions.modules` / `restrictions.features`, written as
/// `module`, `module.submodule` or `module.submodule:permission`.
/// Omitted parts cover everything below them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleGrant {
    module: String,
    submodule: Option<String>,
    permission: Option<PermissionKind>,
}

impl ModuleGrant {
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            submodule: None,
            permission: None,
        }
    }

    pub fn covers(&self, requirement: &PermissionRequirement) -> bool {
        if self.module != requirement.module {
            return false;
        }
        if let Some(submodule) = &self.submodule {
            if submodule != &requirement.submodule {
                return false;
            }
        }
        self.permission
            .map_or(true, |permission| permission == requirement.permission)
    }
}

impl FromStr for ModuleGrant {
    type Err = GrantParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (scope, permission) = match raw.split_once(':') {
            Some((scope, permission)) => (scope, Some(permission.parse::<PermissionKind>()?)),
            None => (raw, None),
        };
        let (module, submodule) = match scope.split_once('.') {
            Some((module, submodule)) => (module.trim(), Some(submodule.trim())),
            None => (scope.trim(), None),
        };
        if module.is_empty() {
            return Err(GrantParseError(format!("`{raw}` has no module")));
        }
        if submodule.map_or(false, str::is_empty) {
            return Err(GrantParseError(format!("`{raw}` has an empty submodule")));
        }
        if permission.is_some() && submodule.is_none() {
            return Err(GrantParseError(format!(
                "`{raw}` names a permission without a submodule"
            )));
        }
        Ok(Self {
            module: module.to_string(),
            submodule: submodule.map(str::to_string),
            permission,
        })
    }
}

impl TryFrom<String> for ModuleGrant {
    type Error = GrantParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleGrant> for String {
    fn from(grant: ModuleGrant) -> Self {
        grant.to_string()
    }
}

impl fmt::Display for ModuleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.module)?;
        if let Some(submodule) = &self.submodule {
            write!(f, ".{submodule}")?;
        }
        if let Some(permission) = &self.permission {
            write!(f, ":{permission}")?;
        }
        Ok(())
    }
}

/// Units of a countable resource an action would add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub resource: CountableResource,
    pub units: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingQuota {
    pub beds: u64,
    pub branches: u64,
}

impl RemainingQuota {
    pub fn get(&self, resource: CountableResource) -> u64 {
        match resource {
            CountableResource::Beds => self.beds,
            CountableResource::Branches => self.branches,
        }
    }
}

/// key: access-denial-reason -> user-visible rejection text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    NoActiveSubscription,
    InactiveStatus(SubscriptionStatus),
    TrialExpired,
    SubscriptionExpired,
    InsufficientPermissions(PermissionRequirement),
    LimitExceeded {
        resource: CountableResource,
        remaining: u64,
    },
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::NoActiveSubscription => "no_subscription",
            DenialReason::InactiveStatus(_) => "inactive_status",
            DenialReason::TrialExpired => "trial_expired",
            DenialReason::SubscriptionExpired => "subscription_expired",
            DenialReason::InsufficientPermissions(_) => "insufficient_permissions",
            DenialReason::LimitExceeded { .. } => "limit_exceeded",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NoActiveSubscription => f.write_str("no active subscription"),
            DenialReason::InactiveStatus(status) => write!(f, "subscription is {status}"),
            DenialReason::TrialExpired => f.write_str("trial expired"),
            DenialReason::SubscriptionExpired => f.write_str("subscription expired"),
            DenialReason::InsufficientPermissions(requirement) => {
                write!(f, "insufficient permissions for {}", requirement.module)
            }
            DenialReason::LimitExceeded {
                resource,
                remaining,
            } => write!(f, "would exceed {resource} limit; remaining: {remaining}"),
        }
    }
}

/// key: access-decision -> result of one gate evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    /// Stable identifier of the denial, for clients that branch on it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<RemainingQuota>,
    #[serde(skip)]
    pub denial: Option<DenialReason>,
    #[serde(skip)]
    pub consumes: Option<ResourceDelta>,
}

impl AccessDecision {
    pub fn allow(remaining: Option<RemainingQuota>, consumes: Option<ResourceDelta>) -> Self {
        Self {
            allowed: true,
            reason_code: None,
            denial_code: None,
            remaining,
            denial: None,
            consumes,
        }
    }

    pub fn deny(reason: DenialReason, remaining: Option<RemainingQuota>) -> Self {
        Self {
            allowed: false,
            reason_code: Some(reason.to_string()),
            denial_code: Some(reason.code()),
            remaining,
            denial: Some(reason),
            consumes: None,
        }
    }

    pub fn into_result(self) -> Result<Self, AccessError> {
        match self.denial {
            Some(reason) => Err(AccessError::AccessDenied(reason)),
            None => Ok(self),
        }
    }
}
