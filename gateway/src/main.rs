use anyhow::Context;
use gateway::authz::AuthorizationEngine;
use gateway::catalog::DeviceCatalog;
use gateway::config::Config;
use gateway::db::{self, PgDeviceStore, PgGrantStore};
use gateway::engine::PgAnalyticsEngine;
use gateway::identity::{ClaimsVerifier, IdentityResolver};
use gateway::metrics;
use gateway::query::QueryGateway;
use gateway::rest::{self, AppState};
use gateway::service::FarmService;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting farm data gateway");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    info!(
        "Polling every {}ms, at most {} attempts",
        config.poll_interval_ms, config.max_poll_attempts
    );
    if config.jwt_secret == "change-me" {
        warn!("JWT_SECRET is not set, using the development default");
    }

    let query_settings = config.query_settings();
    query_settings
        .validate()
        .context("Invalid query paging configuration")?;

    metrics::init_metrics();

    let pool = db::make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;

    let catalog = Arc::new(DeviceCatalog::new(Arc::new(PgDeviceStore::new(pool.clone()))));
    let authz = Arc::new(AuthorizationEngine::new(
        Arc::new(PgGrantStore::new(pool.clone())),
        Arc::clone(&catalog),
    ));
    let gateway = Arc::new(QueryGateway::new(
        Arc::new(PgAnalyticsEngine::new(pool)),
        Arc::clone(&authz),
        Arc::clone(&catalog),
        query_settings,
    ));

    let state = AppState {
        service: Arc::new(FarmService::new(catalog, authz, gateway)),
        verifier: Arc::new(ClaimsVerifier::new(&config.jwt_secret)),
        resolver: Arc::new(IdentityResolver::new(config.group_names())),
        request_timeout: config.request_timeout(),
    };
    let app = rest::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}
