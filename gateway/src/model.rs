use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Logical metric category a grant can open up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKey {
    Moisture,
    Temperature,
}

impl DatasetKey {
    pub const ALL: [DatasetKey; 2] = [DatasetKey::Moisture, DatasetKey::Temperature];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKey::Moisture => "moisture",
            DatasetKey::Temperature => "temperature",
        }
    }

    /// Telemetry column holding this metric.
    pub fn column(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moisture" => Ok(DatasetKey::Moisture),
            "temperature" => Ok(DatasetKey::Temperature),
            other => Err(Error::Validation(format!("Unknown dataset key '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Temperature,
    Moisture,
    /// Only ever set on placeholder records.
    Unknown,
}

impl DeviceType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TEMPERATURE" => Some(DeviceType::Temperature),
            "MOISTURE" => Some(DeviceType::Moisture),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Temperature => "TEMPERATURE",
            DeviceType::Moisture => "MOISTURE",
            DeviceType::Unknown => "UNKNOWN",
        }
    }

    /// Dataset a device of this type reports by default.
    pub fn dataset_key(&self) -> Option<DatasetKey> {
        match self {
            DeviceType::Temperature => Some(DatasetKey::Temperature),
            DeviceType::Moisture => Some(DatasetKey::Moisture),
            DeviceType::Unknown => None,
        }
    }
}

/// Device row exactly as storage returned it; nothing is guaranteed present.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct DeviceRecord {
    pub id: Option<String>,
    pub farm_id: Option<String>,
    pub device_type: Option<String>,
    pub dev_eui: Option<String>,
    pub application_id: Option<String>,
    pub gateway_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub device_type: DeviceType,
    pub farm_id: String,
    pub dev_eui: String,
    pub application_id: String,
    pub gateway_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when this is a placeholder standing in for a malformed record.
    pub degraded: bool,
}

/// Device as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub farm_id: String,
    pub dev_eui: String,
    pub application_id: String,
    pub gateway_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub degraded: bool,
}

impl From<&Device> for DeviceView {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            device_type: device.device_type,
            farm_id: device.farm_id.clone(),
            dev_eui: device.dev_eui.clone(),
            application_id: device.application_id.clone(),
            gateway_id: device.gateway_id.clone(),
            name: device.name.clone(),
            description: device.description.clone(),
            location: device.location.clone(),
            created_at: device.created_at,
            updated_at: device.updated_at,
            degraded: device.degraded,
        }
    }
}

/// A time-bounded authorization scoping a user to dataset keys and,
/// optionally, specific devices of one farm.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAccessGrant {
    pub user_sub: String,
    pub farm_id: String,
    /// Raw keys as stored; keys outside [`DatasetKey`] grant nothing.
    pub dataset_keys: Vec<String>,
    /// Empty means every device of the farm.
    pub device_ids: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    pub ttl: i64,
    pub created_by_sub: String,
    pub created_at: DateTime<Utc>,
}

impl UserAccessGrant {
    /// Builds a new grant for an administrative issue action.
    pub fn issue(
        user_sub: &str,
        farm_id: &str,
        dataset_keys: &[DatasetKey],
        device_ids: &[String],
        expires_at: DateTime<Utc>,
        created_by_sub: &str,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if user_sub.trim().is_empty() {
            return Err(Error::Validation("Grant user cannot be empty".to_string()));
        }
        if farm_id.trim().is_empty() {
            return Err(Error::Validation("Grant farm cannot be empty".to_string()));
        }
        if dataset_keys.is_empty() {
            return Err(Error::Validation(
                "Grant must name at least one dataset key".to_string(),
            ));
        }
        if expires_at <= now {
            return Err(Error::Validation(format!(
                "Grant expiry {} is not in the future",
                expires_at.to_rfc3339()
            )));
        }

        let keys: BTreeSet<DatasetKey> = dataset_keys.iter().copied().collect();

        Ok(Self {
            user_sub: user_sub.to_string(),
            farm_id: farm_id.to_string(),
            dataset_keys: keys.iter().map(|k| k.as_str().to_string()).collect(),
            device_ids: device_ids
                .iter()
                .filter(|id| !id.trim().is_empty())
                .cloned()
                .collect(),
            expires_at,
            ttl: expires_at.timestamp(),
            created_by_sub: created_by_sub.to_string(),
            created_at: now,
        })
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Dataset keys this grant opens, ignoring anything outside the vocabulary.
    pub fn known_dataset_keys(&self) -> impl Iterator<Item = DatasetKey> + '_ {
        self.dataset_keys.iter().filter_map(|k| k.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTimeSeries {
    pub device_id: String,
    pub points: Vec<TimeSeriesPoint>,
}
