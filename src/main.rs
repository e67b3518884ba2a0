use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use pg_access::access::{
    refresh, AccessPolicy, AccessThresholds, HttpSubscriptionSource, PgSubscriptionSource,
    SubscriptionSource, TenantRegistry,
};
use pg_access::config;
use pg_access::routes::api_routes;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "PG Access API"
}

async fn connect_source() -> Result<Option<Arc<dyn SubscriptionSource>>, Box<dyn std::error::Error>> {
    if let Some(base_url) = config::SUBSCRIPTION_SOURCE_URL.as_deref() {
        let source: Arc<dyn SubscriptionSource> = Arc::new(HttpSubscriptionSource::new(
            base_url,
            config::SUBSCRIPTION_SOURCE_TOKEN.clone(),
        )?);
        return Ok(Some(source));
    }

    let Some(db_url) = config::DATABASE_URL.as_deref() else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let source: Arc<dyn SubscriptionSource> = Arc::new(PgSubscriptionSource::new(pool));
    Ok(Some(source))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let policy = Arc::new(AccessPolicy::from_env()?);
    let registry = Arc::new(TenantRegistry::new(policy, AccessThresholds::from_env()));

    let source = connect_source().await?;
    match &source {
        Some(source) => {
            refresh::spawn(
                registry.clone(),
                source.clone(),
                Duration::from_secs(*config::SUBSCRIPTION_REFRESH_INTERVAL_SECS),
            );
        }
        None => tracing::warn!(
            "no subscription source configured; tenants stay unsubscribed until a record is pushed"
        ),
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let mut app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(registry.clone()));
    if let Some(source) = source {
        app = app.layer(Extension(source));
    }

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
