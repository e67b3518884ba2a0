use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config;

use super::models::{CountableResource, PermissionKind, PermissionRequirement, ResourceDelta};
use super::routing::{EndpointSet, RouteRule, RouteTable, RouteTableError, Verb};

pub const DEFAULT_PREFIX_DEPTH: usize = 4;

const DEFAULT_BYPASS_ROLES: &[&str] = &["superadmin", "support"];

/// Reachable in every subscription state.
const ALWAYS_ALLOWED: &[&str] = &["/api/auth", "POST /api/subscription/activate-trial"];

/// Reachable by tenants without any subscription record.
const BOOTSTRAP: &[&str] = &[
    "POST /api/auth/login",
    "POST /api/auth/logout",
    "POST /api/auth/refresh",
    "GET /api/subscription/me",
];

type BuiltinRoute = (
    Verb,
    &'static str,
    &'static str,
    &'static str,
    PermissionKind,
    Option<CountableResource>,
);

const BUILTIN_ROUTES: &[BuiltinRoute] = &[
    (Verb::Post, "/api/residents", "residents", "profiles", PermissionKind::Create, Some(CountableResource::Beds)),
    (Verb::Put, "/api/residents/:id", "residents", "profiles", PermissionKind::Update, None),
    (Verb::Patch, "/api/residents/:id", "residents", "profiles", PermissionKind::Update, None),
    (Verb::Delete, "/api/residents/:id", "residents", "profiles", PermissionKind::Delete, None),
    (Verb::Post, "/api/residents/:id/checkout", "residents", "checkout", PermissionKind::Update, None),
    (Verb::Post, "/api/branches", "multi_branch", "branches", PermissionKind::Create, Some(CountableResource::Branches)),
    (Verb::Put, "/api/branches/:id", "multi_branch", "branches", PermissionKind::Update, None),
    (Verb::Delete, "/api/branches/:id", "multi_branch", "branches", PermissionKind::Delete, None),
    (Verb::Post, "/api/rooms", "rooms", "inventory", PermissionKind::Create, None),
    (Verb::Put, "/api/rooms/:id", "rooms", "inventory", PermissionKind::Update, None),
    (Verb::Delete, "/api/rooms/:id", "rooms", "inventory", PermissionKind::Delete, None),
    (Verb::Get, "/api/payments", "payments", "collections", PermissionKind::Read, None),
    (Verb::Post, "/api/payments", "payments", "collections", PermissionKind::Create, None),
    (Verb::Get, "/api/expenses", "expenses", "tracking", PermissionKind::Read, None),
    (Verb::Post, "/api/expenses", "expenses", "tracking", PermissionKind::Create, None),
    (Verb::Get, "/api/expenses/reports", "reports", "expense_reports", PermissionKind::Read, None),
    (Verb::Get, "/api/reports", "reports", "analytics", PermissionKind::Read, None),
    (Verb::Post, "/api/staff", "staff", "management", PermissionKind::Create, None),
    (Verb::Delete, "/api/staff/:id", "staff", "management", PermissionKind::Delete, None),
    (Verb::Get, "/api/activity-logs", "activity_log", "entries", PermissionKind::Read, None),
    (Verb::Post, "/api/notifications/broadcast", "notifications", "broadcast", PermissionKind::Create, None),
];

#[derive(Debug, Error)]
pub enum PolicyFileError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid policy file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid route table: {0}")]
    Routes(#[from] RouteTableError),
    #[error("invalid route `{path}`: {message}")]
    InvalidRoute { path: String, message: String },
}

/// key: access-policy -> bypass roles, always-allowed endpoints, bootstrap endpoints, routes
/// Built once at startup and shared by every tenant context.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    bypass_roles: BTreeSet<String>,
    always_allowed: EndpointSet,
    bootstrap: EndpointSet,
    routes: RouteTable,
}

impl AccessPolicy {
    pub fn new(
        bypass_roles: impl IntoIterator<Item = impl AsRef<str>>,
        always_allowed: EndpointSet,
        bootstrap: EndpointSet,
        routes: RouteTable,
    ) -> Self {
        Self {
            bypass_roles: normalize_roles(bypass_roles),
            always_allowed,
            bootstrap,
            routes,
        }
    }

    /// The PG management route table with default endpoint sets.
    pub fn builtin(prefix_depth: usize) -> Result<Self, PolicyFileError> {
        Ok(Self::new(
            DEFAULT_BYPASS_ROLES,
            EndpointSet::parse(ALWAYS_ALLOWED)?,
            EndpointSet::parse(BOOTSTRAP)?,
            builtin_routes(prefix_depth)?,
        ))
    }

    pub fn from_env() -> Result<Self, PolicyFileError> {
        let policy = match config::ACCESS_POLICY_PATH.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::builtin(*config::ACCESS_PATH_PREFIX_DEPTH)?
                .with_bypass_roles(config::ACCESS_BYPASS_ROLES.iter()),
        };
        info!(
            routes = policy.routes.len(),
            prefix_depth = policy.routes.prefix_depth(),
            bypass_roles = policy.bypass_roles.len(),
            "access policy loaded"
        );
        Ok(policy)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyFileError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| PolicyFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Sections missing from the file fall back to the built-in values.
    pub fn from_yaml_str(raw: &str) -> Result<Self, PolicyFileError> {
        let file: PolicyFile = serde_yaml::from_str(raw)?;
        let prefix_depth = file.prefix_depth.unwrap_or(DEFAULT_PREFIX_DEPTH);

        let always_allowed = match &file.always_allowed {
            Some(entries) => EndpointSet::parse(entries)?,
            None => EndpointSet::parse(ALWAYS_ALLOWED)?,
        };
        let bootstrap = match &file.bootstrap {
            Some(entries) => EndpointSet::parse(entries)?,
            None => EndpointSet::parse(BOOTSTRAP)?,
        };
        let routes = match file.routes {
            Some(entries) => {
                let mut builder = RouteTable::builder(prefix_depth);
                for entry in entries {
                    builder = builder.route(entry.into_rule()?);
                }
                builder.build()?
            }
            None => builtin_routes(prefix_depth)?,
        };
        let policy = match file.bypass_roles {
            Some(roles) => Self::new(roles, always_allowed, bootstrap, routes),
            None => Self::new(DEFAULT_BYPASS_ROLES, always_allowed, bootstrap, routes),
        };
        Ok(policy)
    }

    pub fn with_bypass_roles(mut self, roles: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.bypass_roles = normalize_roles(roles);
        self
    }

    pub fn is_privileged(&self, role: &str) -> bool {
        self.bypass_roles
            .contains(&role.trim().to_ascii_lowercase())
    }

    pub fn is_always_allowed(&self, verb: Verb, path: &str) -> bool {
        self.always_allowed.matches(verb, path)
    }

    pub fn is_bootstrap(&self, verb: Verb, path: &str) -> bool {
        self.bootstrap.matches(verb, path)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

fn normalize_roles(roles: impl IntoIterator<Item = impl AsRef<str>>) -> BTreeSet<String> {
    roles
        .into_iter()
        .map(|role| role.as_ref().trim().to_ascii_lowercase())
        .filter(|role| !role.is_empty())
        .collect()
}

fn builtin_routes(prefix_depth: usize) -> Result<RouteTable, RouteTableError> {
    BUILTIN_ROUTES
        .iter()
        .fold(
            RouteTable::builder(prefix_depth),
            |builder, (verb, pattern, module, submodule, permission, consumes)| {
                let mut rule = RouteRule::new(*verb, *pattern)
                    .requires(PermissionRequirement::new(*module, *submodule, *permission));
                if let Some(resource) = consumes {
                    rule = rule.consumes(ResourceDelta {
                        resource: *resource,
                        units: 1,
                    });
                }
                builder.route(rule)
            },
        )
        .build()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(default)]
    prefix_depth: Option<usize>,
    #[serde(default)]
    bypass_roles: Option<Vec<String>>,
    #[serde(default)]
    always_allowed: Option<Vec<String>>,
    #[serde(default)]
    bootstrap: Option<Vec<String>>,
    #[serde(default)]
    routes: Option<Vec<RouteEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteEntry {
    path: String,
    #[serde(default = "any_verb")]
    verb: Verb,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    submodule: Option<String>,
    #[serde(default)]
    permission: Option<PermissionKind>,
    #[serde(default)]
    consumes: Option<CountableResource>,
    #[serde(default = "one_unit")]
    units: u64,
}

fn any_verb() -> Verb {
    Verb::Any
}

fn one_unit() -> u64 {
    1
}

impl RouteEntry {
    fn into_rule(self) -> Result<RouteRule, PolicyFileError> {
        if self.module.is_none() && (self.submodule.is_some() || self.permission.is_some()) {
            return Err(PolicyFileError::InvalidRoute {
                path: self.path,
                message: "submodule/permission given without module".to_string(),
            });
        }
        if self.units == 0 {
            return Err(PolicyFileError::InvalidRoute {
                path: self.path,
                message: "units must be at least 1".to_string(),
            });
        }

        let mut rule = RouteRule::new(self.verb, self.path);
        if let Some(module) = self.module {
            let submodule = self.submodule.unwrap_or_else(|| module.clone());
            let permission = self
                .permission
                .unwrap_or_else(|| PermissionKind::for_verb(self.verb));
            rule = rule.requires(PermissionRequirement::new(module, submodule, permission));
        }
        if let Some(resource) = self.consumes {
            rule = rule.consumes(ResourceDelta {
                resource,
                units: self.units,
            });
        }
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_policy_maps_pg_routes() {
        let policy = AccessPolicy::builtin(DEFAULT_PREFIX_DEPTH).unwrap();
        let rule = policy.routes().resolve("/api/branches", Verb::Post).unwrap();
        assert_eq!(rule.requirement.as_ref().unwrap().module, "multi_branch");
        assert_eq!(
            rule.consumes,
            Some(ResourceDelta {
                resource: CountableResource::Branches,
                units: 1
            })
        );
        assert!(policy.is_always_allowed(Verb::Post, "/api/auth/login"));
        assert!(policy.is_bootstrap(Verb::Get, "/api/subscription/me"));
        assert!(!policy.is_bootstrap(Verb::Post, "/api/residents"));
    }

    #[test]
    fn builtin_policy_needs_room_for_nested_routes() {
        assert!(matches!(
            AccessPolicy::builtin(2),
            Err(PolicyFileError::Routes(RouteTableError::TooDeep { .. }))
        ));
    }

    #[test]
    fn bypass_roles_are_case_insensitive() {
        let policy = AccessPolicy::builtin(DEFAULT_PREFIX_DEPTH)
            .unwrap()
            .with_bypass_roles(["SuperAdmin"]);
        assert!(policy.is_privileged("superadmin"));
        assert!(policy.is_privileged(" SUPERADMIN "));
        assert!(!policy.is_privileged("support"));
    }

    #[test]
    fn yaml_routes_replace_builtin_table() {
        let raw = r#"
prefix_depth: 3
bypass_roles: [ops]
routes:
  - path: /api/laundry
    verb: POST
    module: laundry
  - path: /api/residents
    verb: post
    module: residents
    submodule: profiles
    consumes: beds
    units: 2
"#;
        let policy = AccessPolicy::from_yaml_str(raw).unwrap();
        assert_eq!(policy.routes().len(), 2);
        assert_eq!(policy.routes().prefix_depth(), 3);
        assert!(policy.is_privileged("ops"));
        assert!(!policy.is_privileged("superadmin"));

        let laundry = policy
            .routes()
            .requirement_for("/api/laundry", Verb::Post)
            .unwrap();
        assert_eq!(laundry.submodule, "laundry");
        assert_eq!(laundry.permission, PermissionKind::Create);

        let residents = policy.routes().resolve("/api/residents", Verb::Post).unwrap();
        assert_eq!(residents.consumes.unwrap().units, 2);
        assert!(policy.routes().resolve("/api/branches", Verb::Post).is_none());
        assert!(policy.is_always_allowed(Verb::Get, "/api/auth/me"));
    }

    #[test]
    fn yaml_rejects_permission_without_module() {
        let raw = r#"
routes:
  - path: /api/laundry
    permission: read
"#;
        assert!(matches!(
            AccessPolicy::from_yaml_str(raw),
            Err(PolicyFileError::InvalidRoute { .. })
        ));
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        assert!(AccessPolicy::from_yaml_str("prefix_dept: 3").is_err());
    }
}
