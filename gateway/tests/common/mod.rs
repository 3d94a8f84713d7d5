use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use gateway::authz::AuthorizationEngine;
use gateway::catalog::DeviceCatalog;
use gateway::engine::{
    AnalyticsEngine, ExecutionId, ExecutionState, ExecutionStatus, ParameterizedQuery, ResultPage,
    ResultRow,
};
use gateway::errors::{Error, Result};
use gateway::identity::{ClaimsVerifier, IdentityResolver};
use gateway::model::{DeviceRecord, UserAccessGrant};
use gateway::query::{QuerySettings, QueryGateway};
use gateway::rest::{self, AppState};
use gateway::service::FarmService;
use gateway::store::{DeviceStore, GrantStore};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "integration-secret";

#[derive(Default)]
pub struct InMemoryGrants {
    pub grants: Vec<UserAccessGrant>,
}

#[async_trait]
impl GrantStore for InMemoryGrants {
    async fn list_grants(&self, user_sub: &str, farm_id: &str) -> Result<Vec<UserAccessGrant>> {
        Ok(self
            .grants
            .iter()
            .filter(|g| g.user_sub == user_sub && g.farm_id == farm_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryDevices {
    pub devices: HashMap<String, Vec<DeviceRecord>>,
}

#[async_trait]
impl DeviceStore for InMemoryDevices {
    async fn list_by_farm(&self, farm_id: &str) -> Result<Vec<DeviceRecord>> {
        Ok(self.devices.get(farm_id).cloned().unwrap_or_default())
    }
}

/// Engine replaying a fixed script of status answers and a fixed result set.
pub struct ScriptedEngine {
    pub statuses: Vec<ExecutionStatus>,
    pub rows: Vec<ResultRow>,
    pub submitted: Mutex<Vec<ParameterizedQuery>>,
    checks: Mutex<usize>,
    forgotten: Mutex<usize>,
}

impl ScriptedEngine {
    pub fn new(statuses: Vec<ExecutionStatus>, rows: Vec<ResultRow>) -> Self {
        Self {
            statuses,
            rows,
            submitted: Mutex::new(Vec::new()),
            checks: Mutex::new(0),
            forgotten: Mutex::new(0),
        }
    }

    pub fn succeeding(rows: Vec<ResultRow>) -> Self {
        Self::new(vec![ExecutionStatus::new(ExecutionState::Succeeded)], rows)
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn forgotten(&self) -> usize {
        *self.forgotten.lock().unwrap()
    }
}

#[async_trait]
impl AnalyticsEngine for ScriptedEngine {
    async fn submit(&self, query: &ParameterizedQuery) -> Result<ExecutionId> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(query.clone());
        Ok(ExecutionId::new(format!("exec-{}", submitted.len())))
    }

    async fn status(&self, _execution_id: &ExecutionId) -> Result<ExecutionStatus> {
        let mut checks = self.checks.lock().unwrap();
        let status = self
            .statuses
            .get(*checks)
            .or_else(|| self.statuses.last())
            .cloned()
            .ok_or_else(|| Error::Engine("no scripted status".to_string()))?;
        *checks += 1;
        Ok(status)
    }

    async fn results(
        &self,
        _execution_id: &ExecutionId,
        _page_size: usize,
        _next_token: Option<String>,
    ) -> Result<ResultPage> {
        Ok(ResultPage {
            rows: self.rows.clone(),
            next_token: None,
        })
    }

    async fn forget(&self, _execution_id: &ExecutionId) -> Result<()> {
        *self.forgotten.lock().unwrap() += 1;
        Ok(())
    }
}

pub fn device(id: &str, farm_id: &str, device_type: &str) -> DeviceRecord {
    DeviceRecord {
        id: Some(id.to_string()),
        farm_id: Some(farm_id.to_string()),
        device_type: Some(device_type.to_string()),
        dev_eui: Some(format!("eui-{}", id)),
        application_id: Some("lorasensor01".to_string()),
        gateway_id: Some("eui-e45f01fffec5bcf".to_string()),
        name: Some(format!("Sensor {}", id)),
        description: None,
        location: Some("North field, row 3".to_string()),
        last_seen_at: None,
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

pub fn grant(user_sub: &str, farm_id: &str, keys: &[&str], devices: &[&str], hours: i64) -> UserAccessGrant {
    let expires_at = Utc::now() + ChronoDuration::hours(hours);
    UserAccessGrant {
        user_sub: user_sub.to_string(),
        farm_id: farm_id.to_string(),
        dataset_keys: keys.iter().map(|k| k.to_string()).collect(),
        device_ids: devices.iter().map(|d| d.to_string()).collect(),
        expires_at,
        ttl: expires_at.timestamp(),
        created_by_sub: "admin-1".to_string(),
        created_at: Utc::now(),
    }
}

pub fn row(values: &[Option<&str>]) -> ResultRow {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

pub fn token(sub: &str, groups: &[&str]) -> String {
    let exp = Utc::now().timestamp() + 3600;
    encode(
        &Header::default(),
        &json!({ "sub": sub, "cognito:groups": groups, "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn app(
    grants: InMemoryGrants,
    devices: InMemoryDevices,
    engine: Arc<ScriptedEngine>,
) -> axum::Router {
    let catalog = Arc::new(DeviceCatalog::new(Arc::new(devices)));
    let authz = Arc::new(AuthorizationEngine::new(
        Arc::new(grants),
        Arc::clone(&catalog),
    ));
    let settings = QuerySettings {
        poll_interval: Duration::from_millis(5),
        max_poll_attempts: 3,
        ..QuerySettings::default()
    };
    let gateway = Arc::new(QueryGateway::new(
        engine,
        Arc::clone(&authz),
        Arc::clone(&catalog),
        settings,
    ));

    rest::create_router(AppState {
        service: Arc::new(FarmService::new(catalog, authz, gateway)),
        verifier: Arc::new(ClaimsVerifier::new(SECRET)),
        resolver: Arc::new(IdentityResolver::default()),
        request_timeout: Duration::from_secs(5),
    })
}
