use crate::errors::Result;
use crate::model::{DeviceRecord, UserAccessGrant};
use async_trait::async_trait;

/// Read-only source of access grants.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// All grants recorded for the user on the farm, expired ones included.
    async fn list_grants(&self, user_sub: &str, farm_id: &str) -> Result<Vec<UserAccessGrant>>;
}

/// Read-only device storage, in creation order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_by_farm(&self, farm_id: &str) -> Result<Vec<DeviceRecord>>;
}
