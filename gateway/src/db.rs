use crate::errors::Result;
use crate::model::{DeviceRecord, UserAccessGrant};
use crate::store::{DeviceStore, GrantStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    user_sub: String,
    farm_id: String,
    dataset_keys: Vec<String>,
    device_ids: Option<Vec<String>>,
    expires_at: DateTime<Utc>,
    ttl: i64,
    created_by_sub: String,
    created_at: DateTime<Utc>,
}

impl From<GrantRow> for UserAccessGrant {
    fn from(row: GrantRow) -> Self {
        Self {
            user_sub: row.user_sub,
            farm_id: row.farm_id,
            dataset_keys: row.dataset_keys,
            device_ids: row.device_ids.unwrap_or_default().into_iter().collect(),
            expires_at: row.expires_at,
            ttl: row.ttl,
            created_by_sub: row.created_by_sub,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GrantStore for PgGrantStore {
    async fn list_grants(&self, user_sub: &str, farm_id: &str) -> Result<Vec<UserAccessGrant>> {
        // Single statement, so the caller sees one consistent snapshot
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT user_sub, farm_id, dataset_keys, device_ids, expires_at, ttl,
                   created_by_sub, created_at
            FROM user_access_grants
            WHERE user_sub = $1 AND farm_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_sub)
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await?;

        debug!("Loaded {} grants for {} on {}", rows.len(), user_sub, farm_id);
        Ok(rows.into_iter().map(UserAccessGrant::from).collect())
    }
}

#[derive(Debug, Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn list_by_farm(&self, farm_id: &str) -> Result<Vec<DeviceRecord>> {
        let records = sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT id, farm_id, device_type, dev_eui, application_id, gateway_id,
                   name, description, location, last_seen_at, created_at, updated_at
            FROM devices
            WHERE farm_id = $1
            ORDER BY created_at ASC NULLS LAST, id ASC
            "#,
        )
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
