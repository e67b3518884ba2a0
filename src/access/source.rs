use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::models::Subscription;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid subscription source url `{0}`")]
    InvalidUrl(String),
    #[error("subscription source request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("subscription source returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("subscription store query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// key: access-source -> authoritative subscription record per tenant
/// `Ok(None)` means the tenant has no subscription at all.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, tenant_id: &str) -> Result<Option<Value>, SourceError>;

    /// Stores a pushed record so the next fetch returns it; `None` retires the
    /// current one. `Ok(false)` when the source is read-only and the push only
    /// lasts until the next poll.
    async fn persist(
        &self,
        _tenant_id: &str,
        _subscription: Option<&Subscription>,
    ) -> Result<bool, SourceError> {
        Ok(false)
    }
}

/// Billing backend over HTTP: `GET {base}/api/subscription/tenants/{tenant}`.
#[derive(Clone)]
pub struct HttpSubscriptionSource {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpSubscriptionSource {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, SourceError> {
        let base_url =
            Url::parse(base_url).map_err(|_| SourceError::InvalidUrl(base_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    fn endpoint(&self, tenant_id: &str) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "subscription", "tenants", tenant_id]);
        Ok(url)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

#[async_trait]
impl SubscriptionSource for HttpSubscriptionSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, tenant_id: &str) -> Result<Option<Value>, SourceError> {
        let response = self
            .auth(self.client.get(self.endpoint(tenant_id)?))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<Value>().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SourceError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    plan_id: Option<String>,
    status: String,
    is_trial_active: bool,
    trial_end_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    restrictions: Json<Value>,
    usage: Json<Value>,
}

impl SubscriptionRow {
    fn into_payload(self) -> Value {
        json!({
            "status": self.status,
            "planId": self.plan_id,
            "isTrialActive": self.is_trial_active,
            "trialEndDate": self.trial_end_date,
            "endDate": self.end_date,
            "restrictions": self.restrictions.0,
            "usage": self.usage.0,
        })
    }
}

/// key: access-source-pg -> current row of `tenant_subscriptions`
#[derive(Clone)]
pub struct PgSubscriptionSource {
    pool: PgPool,
}

impl PgSubscriptionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Marks the tenant's current row superseded. Returns whether one existed.
    pub async fn retire(&self, tenant_id: &str) -> Result<bool, SourceError> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_subscriptions
            SET superseded_at = NOW(), updated_at = NOW()
            WHERE tenant_id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the tenant's current row superseded and inserts `subscription`
    /// as the new current row. Rows are never deleted.
    pub async fn supersede(
        &self,
        tenant_id: &str,
        subscription: &Subscription,
    ) -> Result<Uuid, SourceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tenant_subscriptions
            SET superseded_at = NOW(), updated_at = NOW()
            WHERE tenant_id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .execute(&mut tx)
        .await?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO tenant_subscriptions (
                tenant_id, plan_id, status, is_trial_active,
                trial_end_date, end_date, restrictions, usage
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(subscription.plan_id.as_deref())
        .bind(subscription.status.as_str())
        .bind(subscription.is_trial_active)
        .bind(subscription.trial_end_date)
        .bind(subscription.end_date)
        .bind(Json(&subscription.restrictions))
        .bind(Json(&subscription.usage))
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }
}

#[async_trait]
impl SubscriptionSource for PgSubscriptionSource {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch(&self, tenant_id: &str) -> Result<Option<Value>, SourceError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT plan_id, status, is_trial_active, trial_end_date, end_date, restrictions, usage
            FROM tenant_subscriptions
            WHERE tenant_id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionRow::into_payload))
    }

    async fn persist(
        &self,
        tenant_id: &str,
        subscription: Option<&Subscription>,
    ) -> Result<bool, SourceError> {
        match subscription {
            Some(subscription) => {
                let id = self.supersede(tenant_id, subscription).await?;
                tracing::info!(tenant_id, %id, "subscription row superseded");
            }
            None => {
                self.retire(tenant_id).await?;
                tracing::info!(tenant_id, "subscription row retired");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_tenant_and_keeps_base_path() {
        let source = HttpSubscriptionSource::new("https://billing.example.com/v1/", None).unwrap();
        assert_eq!(
            source.endpoint("pg 7").unwrap().as_str(),
            "https://billing.example.com/v1/api/subscription/tenants/pg%207"
        );

        let source = HttpSubscriptionSource::new("https://billing.example.com", None).unwrap();
        assert_eq!(
            source.endpoint("pg-7").unwrap().as_str(),
            "https://billing.example.com/api/subscription/tenants/pg-7"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpSubscriptionSource::new("not a url", None),
            Err(SourceError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpSubscriptionSource::new("mailto:billing@example.com", None),
            Err(SourceError::InvalidUrl(_))
        ));
    }

    #[test]
    fn row_payload_uses_wire_names() {
        let row = SubscriptionRow {
            plan_id: Some("pro".into()),
            status: "active".into(),
            is_trial_active: false,
            trial_end_date: None,
            end_date: None,
            restrictions: Json(json!({"maxBeds": 40, "modules": ["residents"]})),
            usage: Json(json!({"bedsUsed": 12})),
        };
        let subscription = Subscription::from_payload(&row.into_payload()).unwrap().unwrap();
        assert_eq!(subscription.plan_id.as_deref(), Some("pro"));
        assert_eq!(subscription.restrictions.max_beds, Some(40));
        assert_eq!(subscription.usage.beds_used, Some(12));
    }
}
