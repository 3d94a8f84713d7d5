use crate::errors::Result;
use crate::metrics::DEGRADED_DEVICE_RECORDS_TOTAL;
use crate::model::{Device, DeviceRecord, DeviceType};
use crate::store::DeviceStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const SENTINEL_NAME: &str = "Invalid device record";
pub const SENTINEL_PLACEHOLDER: &str = "unknown";

/// Lists the devices of a farm, substituting placeholders for records that
/// cannot be read.
///
/// Defaulting policy:
/// - `id`, `farm_id`, `dev_eui`, `application_id`, a known `device_type`,
///   `created_at` and `updated_at` are required. Blank strings count as missing.
/// - `gateway_id`, `name`, `description`, `location`, `last_seen_at` stay `None`
///   when absent; no placeholder text is ever filled in for them.
/// - A record missing any required field becomes a sentinel device: its own id
///   (or `invalid-record-<position>`), type `UNKNOWN`, the requested farm,
///   `unknown` dev EUI and application id, name [`SENTINEL_NAME`], epoch
///   timestamps and `degraded = true`.
pub struct DeviceCatalog {
    store: Arc<dyn DeviceStore>,
}

impl DeviceCatalog {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(farm_id = %farm_id))]
    pub async fn list_devices(&self, farm_id: &str) -> Result<Vec<Device>> {
        let records = self.store.list_by_farm(farm_id).await?;
        debug!("Loaded {} device records", records.len());

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(position, record)| match to_device(&record) {
                Some(device) => device,
                None => {
                    warn!(
                        farm_id = %farm_id,
                        position,
                        record_id = record.id.as_deref().unwrap_or("<missing>"),
                        "Malformed device record replaced with placeholder"
                    );
                    DEGRADED_DEVICE_RECORDS_TOTAL.inc();
                    sentinel(farm_id, position, &record)
                }
            })
            .collect())
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn to_device(record: &DeviceRecord) -> Option<Device> {
    Some(Device {
        id: non_blank(&record.id)?,
        device_type: DeviceType::parse(record.device_type.as_deref()?)?,
        farm_id: non_blank(&record.farm_id)?,
        dev_eui: non_blank(&record.dev_eui)?,
        application_id: non_blank(&record.application_id)?,
        gateway_id: non_blank(&record.gateway_id),
        name: non_blank(&record.name),
        description: non_blank(&record.description),
        location: non_blank(&record.location),
        last_seen_at: record.last_seen_at,
        created_at: record.created_at?,
        updated_at: record.updated_at?,
        degraded: false,
    })
}

fn sentinel(farm_id: &str, position: usize, record: &DeviceRecord) -> Device {
    Device {
        id: non_blank(&record.id).unwrap_or_else(|| format!("invalid-record-{}", position)),
        device_type: DeviceType::Unknown,
        farm_id: farm_id.to_string(),
        dev_eui: SENTINEL_PLACEHOLDER.to_string(),
        application_id: SENTINEL_PLACEHOLDER.to_string(),
        gateway_id: None,
        name: Some(SENTINEL_NAME.to_string()),
        description: None,
        location: None,
        last_seen_at: None,
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
        degraded: true,
    }
}
