pub mod api;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod health;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod refresh;
pub mod routing;
pub mod session;
pub mod source;
pub mod state;
pub mod usage;

pub use error::AccessError;
pub use evaluator::{status_events, AccessThresholds, Action, RestrictionEvaluator, SubscriptionPhase};
pub use events::{AccessEvent, EventEnvelope, EventKind, EventNotifier, PublishOutcome, Unsubscribe};
pub use health::{health_report, HealthIssue, HealthReport, Severity};
pub use middleware::subscription_gate;
pub use models::{
    AccessDecision, CountableResource, DenialReason, ModuleGrant, PermissionKind,
    PermissionRequirement, RemainingQuota, ResourceDelta, Restrictions, Subscription,
    SubscriptionStatus, Usage,
};
pub use policy::{AccessPolicy, PolicyFileError, DEFAULT_PREFIX_DEPTH};
pub use refresh::RefreshSummary;
pub use routing::{EndpointSet, RouteMatch, RouteRule, RouteTable, RouteTableError, Verb};
pub use session::{TenantAccess, TenantRegistry};
pub use source::{HttpSubscriptionSource, PgSubscriptionSource, SourceError, SubscriptionSource};
pub use state::{Reservation, StateSnapshot, SubscriptionState};
pub use usage::{ResourceUsage, UsageTracker};
