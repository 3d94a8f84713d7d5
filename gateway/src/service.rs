use crate::authz::AuthorizationEngine;
use crate::catalog::DeviceCatalog;
use crate::errors::Result;
use crate::identity::{CallerIdentity, Role};
use crate::model::{DeviceTimeSeries, DeviceView};
use crate::query::{QueryGateway, SeriesRequest};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Inbound operations, each evaluated for one authenticated caller.
pub struct FarmService {
    catalog: Arc<DeviceCatalog>,
    authz: Arc<AuthorizationEngine>,
    gateway: Arc<QueryGateway>,
}

impl FarmService {
    pub fn new(
        catalog: Arc<DeviceCatalog>,
        authz: Arc<AuthorizationEngine>,
        gateway: Arc<QueryGateway>,
    ) -> Self {
        Self {
            catalog,
            authz,
            gateway,
        }
    }

    /// Devices of the farm the caller may see, in creation order.
    #[instrument(skip_all, fields(user_id = %caller.user_id, farm_id = %farm_id))]
    pub async fn list_devices(
        &self,
        caller: &CallerIdentity,
        farm_id: &str,
    ) -> Result<Vec<DeviceView>> {
        if caller.role == Role::Unknown {
            return Ok(Vec::new());
        }

        // One listing feeds both the access decision and the response
        let devices = self.catalog.list_devices(farm_id).await?;
        let visibility = self
            .authz
            .visibility_among(&caller.user_id, caller.role, farm_id, &devices, None)
            .await?;

        let views: Vec<DeviceView> = devices
            .iter()
            .filter(|d| {
                caller.role == Role::Admin || (!d.degraded && visibility.allows_device(&d.id))
            })
            .map(DeviceView::from)
            .collect();

        debug!("{} of {} devices visible", views.len(), devices.len());
        Ok(views)
    }

    pub async fn fetch_device_series(
        &self,
        caller: &CallerIdentity,
        request: &SeriesRequest,
        deadline: Option<Instant>,
    ) -> Result<Vec<DeviceTimeSeries>> {
        self.gateway
            .fetch_device_series(caller, request, deadline)
            .await
    }
}
