use std::sync::Arc;

use chrono::Utc;
use httpmock::prelude::*;
use pg_access::access::refresh::{process_tick, refresh_tenant};
use pg_access::access::{
    AccessPolicy, AccessThresholds, HttpSubscriptionSource, PgSubscriptionSource, SourceError,
    Subscription, SubscriptionSource, SubscriptionStatus, TenantRegistry, DEFAULT_PREFIX_DEPTH,
};
use serde_json::json;
use sqlx::PgPool;

// key: access-source-tests -> billing backend over HTTP, tenant_subscriptions table

fn registry() -> TenantRegistry {
    TenantRegistry::new(
        Arc::new(AccessPolicy::builtin(DEFAULT_PREFIX_DEPTH).unwrap()),
        AccessThresholds::default(),
    )
}

#[tokio::test]
async fn http_source_fetches_with_bearer_token() {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/subscription/tenants/pg-1")
            .header("authorization", "Bearer billing-token");
        then.status(200).json_body(json!({
            "status": "active",
            "planId": "pro",
            "restrictions": {"maxBeds": 40, "modules": ["residents"]},
            "usage": {"bedsUsed": 10}
        }));
    });

    let source =
        HttpSubscriptionSource::new(&server.base_url(), Some("billing-token".to_string())).unwrap();
    let payload = source.fetch("pg-1").await.unwrap().unwrap();
    let subscription = Subscription::from_payload(&payload).unwrap().unwrap();
    assert_eq!(subscription.restrictions.max_beds, Some(40));
    mock.assert();
}

#[tokio::test]
async fn http_source_maps_missing_tenant_to_none() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/api/subscription/tenants/pg-2");
        then.status(404);
    });

    let source = HttpSubscriptionSource::new(&server.base_url(), None).unwrap();
    assert!(source.fetch("pg-2").await.unwrap().is_none());
}

#[tokio::test]
async fn http_failure_keeps_last_known_snapshot() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/api/subscription/tenants/pg-3");
        then.status(503).body("maintenance");
    });

    let registry = registry();
    let access = registry.get_or_create("pg-3");
    access.update_payload(&json!({"status": "active", "restrictions": {"maxBeds": 5}}));

    let source = HttpSubscriptionSource::new(&server.base_url(), None).unwrap();
    let err = refresh_tenant(&access, &source, Utc::now()).await.unwrap_err();
    assert!(matches!(err, SourceError::Status { status: 503, .. }));

    let summary = process_tick(&registry, &source, Utc::now()).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(access.get().unwrap().status, SubscriptionStatus::Active);
    assert_eq!(access.snapshot().revision, 1);
}

#[tokio::test]
async fn malformed_http_payload_leaves_tenant_unsubscribed() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/api/subscription/tenants/pg-4");
        then.status(200).json_body(json!({"status": "trial", "isTrialActive": true}));
    });

    let registry = registry();
    let access = registry.get_or_create("pg-4");
    access.update_payload(&json!({"status": "active"}));

    let source = HttpSubscriptionSource::new(&server.base_url(), None).unwrap();
    refresh_tenant(&access, &source, Utc::now()).await.unwrap();
    assert!(access.get().is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pg_source_supersedes_previous_rows(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let source = PgSubscriptionSource::new(pool.clone());
    assert!(source.fetch("pg-10").await.unwrap().is_none());

    let trial = Subscription::from_payload(&json!({
        "status": "trial",
        "isTrialActive": true,
        "trialEndDate": Utc::now() + chrono::Duration::days(14),
        "restrictions": {"maxBeds": 10, "modules": ["residents"]},
        "usage": {"bedsUsed": 0}
    }))
    .unwrap()
    .unwrap();
    assert!(source.persist("pg-10", Some(&trial)).await.unwrap());

    let mut upgraded = trial.clone();
    upgraded.status = SubscriptionStatus::Active;
    upgraded.is_trial_active = false;
    upgraded.plan_id = Some("growth".into());
    upgraded.restrictions.max_beds = Some(40);
    source.supersede("pg-10", &upgraded).await.unwrap();

    let payload = source.fetch("pg-10").await.unwrap().unwrap();
    let current = Subscription::from_payload(&payload).unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.restrictions.max_beds, Some(40));

    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tenant_subscriptions WHERE tenant_id = $1")
            .bind("pg-10")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 2);

    assert!(source.persist("pg-10", None).await.unwrap());
    assert!(source.fetch("pg-10").await.unwrap().is_none());
    assert!(!source.retire("pg-10").await.unwrap());
}

#[tokio::test]
async fn http_source_does_not_store_pushes() {
    let source = HttpSubscriptionSource::new("http://billing.internal", None).unwrap();
    assert!(!source.persist("pg-12", None).await.unwrap());
}
