use crate::catalog::DeviceCatalog;
use crate::errors::{Error, Result};
use crate::identity::Role;
use crate::metrics::FORBIDDEN_TOTAL;
use crate::model::{DatasetKey, Device, UserAccessGrant};
use crate::store::GrantStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a caller may see on one farm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visibility {
    pub allowed_dataset_keys: BTreeSet<DatasetKey>,
    pub allowed_device_ids: BTreeSet<String>,
}

impl Visibility {
    pub fn is_empty(&self) -> bool {
        self.allowed_dataset_keys.is_empty() && self.allowed_device_ids.is_empty()
    }

    pub fn allows_device(&self, device_id: &str) -> bool {
        self.allowed_device_ids.contains(device_id)
    }

    pub fn allows_dataset(&self, key: DatasetKey) -> bool {
        self.allowed_dataset_keys.contains(&key)
    }
}

/// Computes visible dataset keys and devices from role and grants.
pub struct AuthorizationEngine {
    grants: Arc<dyn GrantStore>,
    catalog: Arc<DeviceCatalog>,
}

impl AuthorizationEngine {
    pub fn new(grants: Arc<dyn GrantStore>, catalog: Arc<DeviceCatalog>) -> Self {
        Self { grants, catalog }
    }

    pub async fn resolve_visibility(
        &self,
        user_id: &str,
        role: Role,
        farm_id: &str,
        requested_device_id: Option<&str>,
    ) -> Result<Visibility> {
        self.resolve_visibility_at(user_id, role, farm_id, requested_device_id, Utc::now())
            .await
    }

    /// Same as [`resolve_visibility`](Self::resolve_visibility) with an explicit clock.
    pub async fn resolve_visibility_at(
        &self,
        user_id: &str,
        role: Role,
        farm_id: &str,
        requested_device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Visibility> {
        // Unknown callers learn nothing, not even whether the farm exists
        if role == Role::Unknown {
            return Ok(Visibility::default());
        }

        let devices = self.catalog.list_devices(farm_id).await?;
        self.visibility_among_at(user_id, role, farm_id, &devices, requested_device_id, now)
            .await
    }

    /// Resolves visibility against an already loaded device listing of the farm.
    pub async fn visibility_among(
        &self,
        user_id: &str,
        role: Role,
        farm_id: &str,
        devices: &[Device],
        requested_device_id: Option<&str>,
    ) -> Result<Visibility> {
        self.visibility_among_at(user_id, role, farm_id, devices, requested_device_id, Utc::now())
            .await
    }

    #[instrument(skip_all, fields(user_id = %user_id, farm_id = %farm_id, role = ?role))]
    async fn visibility_among_at(
        &self,
        user_id: &str,
        role: Role,
        farm_id: &str,
        devices: &[Device],
        requested_device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Visibility> {
        let visibility = match role {
            Role::Admin => Visibility {
                allowed_dataset_keys: DatasetKey::ALL.into_iter().collect(),
                allowed_device_ids: farm_device_ids(devices),
            },
            Role::Temporary => {
                // One read; every decision below works off this snapshot.
                let grants = self.grants.list_grants(user_id, farm_id).await?;
                let active = active_grants(&grants, user_id, farm_id, now);
                debug!("{} of {} grants active", active.len(), grants.len());

                if active.is_empty() {
                    return Ok(Visibility::default());
                }
                merge_grants(&active, farm_device_ids(devices))
            }
            Role::Unknown => return Ok(Visibility::default()),
        };

        if let Some(device_id) = requested_device_id {
            if !visibility.allows_device(device_id) {
                info!(device_id = %device_id, "Requested device outside granted scope");
                FORBIDDEN_TOTAL.inc();
                return Err(Error::Forbidden {
                    farm_id: farm_id.to_string(),
                    device_id: device_id.to_string(),
                });
            }
        }

        Ok(visibility)
    }
}

/// Healthy device ids of the farm listing; sentinels are never granted.
fn farm_device_ids(devices: &[Device]) -> BTreeSet<String> {
    devices
        .iter()
        .filter(|d| !d.degraded)
        .map(|d| d.id.clone())
        .collect()
}

/// Overlapping grants merge by union. Device scope is the union of every
/// restricting grant's devices, or the whole farm when none restricts.
/// Either way only devices of this farm are kept.
fn merge_grants(active: &[&UserAccessGrant], farm_devices: BTreeSet<String>) -> Visibility {
    let mut allowed_dataset_keys = BTreeSet::new();
    for grant in active {
        for raw in &grant.dataset_keys {
            match raw.parse::<DatasetKey>() {
                Ok(key) => {
                    allowed_dataset_keys.insert(key);
                }
                Err(_) => warn!(dataset_key = %raw, "Ignoring unknown dataset key in grant"),
            }
        }
    }

    let restricted: BTreeSet<String> = active
        .iter()
        .flat_map(|g| g.device_ids.iter().cloned())
        .collect();

    let allowed_device_ids = if restricted.is_empty() {
        farm_devices
    } else {
        let foreign = restricted.difference(&farm_devices).count();
        if foreign > 0 {
            warn!("Ignoring {} granted devices not listed on the farm", foreign);
        }
        restricted.intersection(&farm_devices).cloned().collect()
    };

    Visibility {
        allowed_dataset_keys,
        allowed_device_ids,
    }
}

fn active_grants<'a>(
    grants: &'a [UserAccessGrant],
    user_id: &str,
    farm_id: &str,
    now: DateTime<Utc>,
) -> Vec<&'a UserAccessGrant> {
    grants
        .iter()
        .filter(|g| g.user_sub == user_id && g.farm_id == farm_id && g.is_active_at(now))
        .collect()
}
