use once_cell::sync::Lazy;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// Postgres connection string for the authoritative subscription table.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| read_flag("ALLOW_MIGRATION_FAILURE"));

/// key: access-config -> billing backend base URL; preferred over Postgres when set
pub static SUBSCRIPTION_SOURCE_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("SUBSCRIPTION_SOURCE_URL"));

/// key: access-config -> bearer token presented to the billing backend
pub static SUBSCRIPTION_SOURCE_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("SUBSCRIPTION_SOURCE_TOKEN"));

/// key: access-config -> subscription poll cadence
pub static SUBSCRIPTION_REFRESH_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SUBSCRIPTION_REFRESH_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: access-config -> YAML policy file replacing the built-in route table
pub static ACCESS_POLICY_PATH: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("ACCESS_POLICY_PATH"));

/// Roles that bypass every subscription gate. Provide a comma-separated list via
/// `ACCESS_BYPASS_ROLES`; defaults to `superadmin,support`.
pub static ACCESS_BYPASS_ROLES: Lazy<Vec<String>> = Lazy::new(|| {
    read_optional_env("ACCESS_BYPASS_ROLES")
        .map(|value| split_list(&value))
        .filter(|roles| !roles.is_empty())
        .unwrap_or_else(|| vec!["superadmin".to_string(), "support".to_string()])
});

/// key: access-config -> path segments considered by the permission resolver
pub static ACCESS_PATH_PREFIX_DEPTH: Lazy<usize> = Lazy::new(|| {
    std::env::var("ACCESS_PATH_PREFIX_DEPTH")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(4)
});

/// key: access-config -> days before trial end that trigger trialExpiringSoon
pub static ACCESS_TRIAL_WARNING_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("ACCESS_TRIAL_WARNING_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(3)
});

/// key: access-config -> usage percentage that triggers limit warnings
pub static ACCESS_USAGE_WARNING_PERCENT: Lazy<u32> = Lazy::new(|| {
    std::env::var("ACCESS_USAGE_WARNING_PERCENT")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| (1..=100).contains(value))
        .unwrap_or(80)
});

/// key: access-config -> days before term end reported by the health check
pub static ACCESS_TERM_WARNING_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("ACCESS_TERM_WARNING_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(7)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_blank_entries() {
        assert_eq!(
            split_list(" superadmin, ,support ,"),
            vec!["superadmin".to_string(), "support".to_string()]
        );
    }
}
