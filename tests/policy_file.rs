use std::io::Write;

use pg_access::access::{AccessPolicy, PermissionKind, PolicyFileError, Verb};

// key: access-policy-file-tests -> YAML overrides of the built-in route table

#[test]
fn policy_file_overrides_routes_and_keeps_default_endpoint_sets() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
bypass_roles: [platform-admin]
routes:
  - path: /api/laundry
    module: laundry
    submodule: bookings
  - path: /api/laundry/:id
    verb: DELETE
    module: laundry
    submodule: bookings
  - path: /api/beds/bulk
    verb: POST
    module: residents
    submodule: profiles
    permission: create
    consumes: beds
    units: 5
"#
    )
    .unwrap();

    let policy = AccessPolicy::from_file(file.path()).unwrap();
    assert!(policy.is_privileged("Platform-Admin"));
    assert!(!policy.is_privileged("superadmin"));
    assert!(policy.is_always_allowed(Verb::Post, "/api/auth/refresh"));
    assert!(policy.is_bootstrap(Verb::Get, "/api/subscription/me"));

    let any_verb = policy
        .routes()
        .requirement_for("/api/laundry", Verb::Get)
        .unwrap();
    assert_eq!(any_verb.permission, PermissionKind::Read);

    let delete = policy
        .routes()
        .requirement_for("/api/laundry/7", Verb::Delete)
        .unwrap();
    assert_eq!(delete.permission, PermissionKind::Delete);

    let bulk = policy.routes().resolve("/api/beds/bulk", Verb::Post).unwrap();
    assert_eq!(bulk.consumes.unwrap().units, 5);
}

#[test]
fn custom_endpoint_sets_replace_defaults() {
    let policy = AccessPolicy::from_yaml_str(
        r#"
always_allowed: ["/api/public"]
bootstrap: ["POST /api/auth/login"]
"#,
    )
    .unwrap();
    assert!(policy.is_always_allowed(Verb::Get, "/api/public/plans"));
    assert!(!policy.is_always_allowed(Verb::Post, "/api/auth/login"));
    assert!(!policy.is_bootstrap(Verb::Get, "/api/subscription/me"));
    assert!(!policy.routes().is_empty());
}

#[test]
fn duplicate_routes_are_rejected() {
    let result = AccessPolicy::from_yaml_str(
        r#"
routes:
  - path: /api/laundry
    verb: POST
  - path: /api/laundry/
    verb: post
"#,
    );
    assert!(matches!(result, Err(PolicyFileError::Routes(_))));
}

#[test]
fn missing_file_reports_path() {
    let err = AccessPolicy::from_file("/nonexistent/access-policy.yaml").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/access-policy.yaml"));
}
