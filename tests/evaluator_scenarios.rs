use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use pg_access::access::{
    AccessEvent, AccessPolicy, AccessThresholds, Action, CountableResource, EventKind,
    RestrictionEvaluator, Subscription, TenantRegistry, UsageTracker, Verb, DEFAULT_PREFIX_DEPTH,
};
use serde_json::{json, Value};

// key: access-tests -> gate ordering, limits, trial windows

fn policy() -> Arc<AccessPolicy> {
    Arc::new(AccessPolicy::builtin(DEFAULT_PREFIX_DEPTH).unwrap())
}

fn evaluator() -> RestrictionEvaluator {
    RestrictionEvaluator::new(policy())
}

fn subscription(payload: Value) -> Subscription {
    Subscription::from_payload(&payload).unwrap().unwrap()
}

fn active_with(restrictions: Value, usage: Value) -> Subscription {
    subscription(json!({
        "status": "active",
        "planId": "growth",
        "restrictions": restrictions,
        "usage": usage,
    }))
}

fn trial_ending(now: DateTime<Utc>, offset: Duration) -> Subscription {
    subscription(json!({
        "status": "trial",
        "isTrialActive": true,
        "trialEndDate": now + offset,
        "restrictions": {"maxBeds": 10, "maxBranches": 1, "modules": ["residents"]},
        "usage": {"bedsUsed": 0, "branchesUsed": 1},
    }))
}

fn sample_actions() -> Vec<Action> {
    vec![
        Action::new(Verb::Post, "/api/residents"),
        Action::new(Verb::Get, "/api/payments?page=1"),
        Action::new(Verb::Post, "/api/branches"),
        Action::new(Verb::Get, "/api/notices"),
        Action::new(Verb::Get, "/api/subscription/me"),
        Action::new(Verb::Delete, "/api/rooms/12"),
    ]
}

#[test]
fn inactive_statuses_only_reach_always_allowed_endpoints() {
    let evaluator = evaluator();
    let now = Utc::now();
    for status in ["past_due", "expired", "cancelled"] {
        let subscription = subscription(json!({
            "status": status,
            "restrictions": {"maxBeds": 50, "maxBranches": 5, "modules": ["residents", "multi_branch", "payments", "rooms"]},
        }));
        for action in sample_actions() {
            let decision = evaluator.evaluate(Some("owner"), Some(&subscription), &action, now);
            assert!(!decision.allowed, "{status} allowed {:?}", action);
        }
        for action in [
            Action::new(Verb::Post, "/api/auth/login"),
            Action::new(Verb::Post, "/api/subscription/activate-trial"),
        ] {
            assert!(evaluator
                .evaluate(Some("owner"), Some(&subscription), &action, now)
                .allowed);
        }
    }
}

#[test]
fn denial_reason_names_status() {
    let decision = evaluator().evaluate(
        Some("owner"),
        Some(&subscription(json!({"status": "past_due"}))),
        &Action::new(Verb::Get, "/api/payments"),
        Utc::now(),
    );
    assert_eq!(decision.reason_code.as_deref(), Some("subscription is past_due"));
}

#[test]
fn remaining_never_negative() {
    for (max, used) in [(Some(10), 12), (Some(0), 3), (None, 5), (Some(3), 0)] {
        let subscription = active_with(json!({"maxBeds": max}), json!({"bedsUsed": used}));
        let tracker = UsageTracker::new(Some(&subscription));
        let expected = max.map_or(0, |max: i64| (max - used).max(0)) as u64;
        assert_eq!(tracker.remaining(CountableResource::Beds), expected);
    }
}

#[test]
fn identical_updates_yield_identical_decisions() {
    let registry = TenantRegistry::new(policy(), AccessThresholds::default());
    let access = registry.get_or_create("pg-1");
    let payload = json!({
        "status": "active",
        "restrictions": {"maxBeds": 5, "modules": ["residents.profiles"]},
        "usage": {"bedsUsed": 5},
    });
    let now = Utc::now();

    access.update_payload_at(&payload, now);
    let first: Vec<_> = sample_actions()
        .iter()
        .map(|action| access.evaluate_at(Some("manager"), action, now))
        .collect();
    access.update_payload_at(&payload, now);
    let second: Vec<_> = sample_actions()
        .iter()
        .map(|action| access.evaluate_at(Some("manager"), action, now))
        .collect();
    assert_eq!(first, second);
}

#[test]
fn privileged_roles_bypass_every_gate() {
    let evaluator = evaluator();
    let now = Utc::now();
    let expired = subscription(json!({"status": "expired"}));
    for action in sample_actions() {
        assert!(evaluator.evaluate(Some("superadmin"), None, &action, now).allowed);
        assert!(evaluator.evaluate(Some("Support"), Some(&expired), &action, now).allowed);
    }
}

#[test]
fn trial_boundary() {
    let evaluator = evaluator();
    let now = Utc::now();
    let action = Action::new(Verb::Put, "/api/residents/42");

    let expired = trial_ending(now, -Duration::seconds(1));
    let decision = evaluator.evaluate(Some("owner"), Some(&expired), &action, now);
    assert!(!decision.allowed);
    assert_eq!(decision.reason_code.as_deref(), Some("trial expired"));

    let running = trial_ending(now, Duration::days(1));
    assert!(evaluator.evaluate(Some("owner"), Some(&running), &action, now).allowed);
}

#[test]
fn no_subscription_blocks_resident_creation() {
    let decision = evaluator().evaluate(
        Some("owner"),
        None,
        &Action::new(Verb::Post, "/api/residents"),
        Utc::now(),
    );
    assert_eq!(
        serde_json::to_value(&decision).unwrap(),
        json!({
            "allowed": false,
            "reasonCode": "no active subscription",
            "denialCode": "no_subscription"
        })
    );
}

#[test]
fn bed_limit_gate() {
    let evaluator = evaluator();
    let now = Utc::now();
    let action = Action::new(Verb::Post, "/api/residents");

    let full = active_with(json!({"maxBeds": 10, "modules": ["residents"]}), json!({"bedsUsed": 10}));
    let decision = evaluator.evaluate(Some("owner"), Some(&full), &action, now);
    assert!(!decision.allowed);
    assert!(decision.reason_code.unwrap().contains("beds limit"));

    let one_left = active_with(json!({"maxBeds": 10, "modules": ["residents"]}), json!({"bedsUsed": 9}));
    let decision = evaluator.evaluate(Some("owner"), Some(&one_left), &action, now);
    assert!(decision.allowed);
    assert_eq!(decision.remaining.unwrap().beds, 1);
}

#[test]
fn branch_creation_needs_multi_branch_module() {
    let evaluator = evaluator();
    let now = Utc::now();
    let action = Action::new(Verb::Post, "/api/branches");
    let usage = json!({"branchesUsed": 1});

    let without = active_with(json!({"maxBranches": 3, "modules": ["residents"]}), usage.clone());
    let decision = evaluator.evaluate(Some("owner"), Some(&without), &action, now);
    assert!(!decision.allowed);
    assert!(decision.reason_code.unwrap().contains("multi_branch"));

    let with = active_with(json!({"maxBranches": 3, "modules": ["residents", "multi_branch"]}), usage);
    assert!(evaluator.evaluate(Some("owner"), Some(&with), &action, now).allowed);
}

#[test]
fn features_grant_like_modules() {
    let subscription = active_with(
        json!({"features": ["reports.analytics:read"]}),
        json!({}),
    );
    let evaluator = evaluator();
    let now = Utc::now();
    assert!(evaluator
        .evaluate(Some("owner"), Some(&subscription), &Action::new(Verb::Get, "/api/reports/monthly"), now)
        .allowed);
    assert!(!evaluator
        .evaluate(Some("owner"), Some(&subscription), &Action::new(Verb::Get, "/api/expenses/reports"), now)
        .allowed);
}

#[test]
fn one_trial_warning_per_update() {
    let registry = TenantRegistry::new(policy(), AccessThresholds::default());
    let access = registry.get_or_create("pg-2");
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let sink = warnings.clone();
    let _handle = access.notifier().subscribe(EventKind::TrialExpiringSoon, move |event| {
        if let AccessEvent::TrialExpiringSoon { days_remaining, .. } = event {
            sink.lock().push(*days_remaining);
        }
        Ok(())
    });

    let now = Utc::now();
    access.update_at(Some(trial_ending(now, Duration::days(2))), now);
    assert_eq!(*warnings.lock(), vec![2]);
    access.update_at(Some(trial_ending(now, Duration::days(2))), now);
    assert_eq!(*warnings.lock(), vec![2, 2]);

    // outside the window
    access.update_at(Some(trial_ending(now, Duration::days(5))), now);
    assert_eq!(warnings.lock().len(), 2);
}
