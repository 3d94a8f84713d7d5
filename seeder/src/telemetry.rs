use chrono::{DateTime, Duration, Utc};
use gateway::model::DeviceType;
use rand::Rng;

/// One telemetry row as stored in the `telemetry` table.
#[derive(Debug, Clone)]
pub struct Reading {
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
}

/// Readings for one device, oldest first, spaced `interval` apart and ending at `end`.
pub fn generate_readings(
    rng: &mut impl Rng,
    device_id: &str,
    device_type: DeviceType,
    count: usize,
    interval: Duration,
    end: DateTime<Utc>,
) -> Vec<Reading> {
    let mut level: f64 = match device_type {
        DeviceType::Moisture => rng.gen_range(30.0..70.0),
        _ => rng.gen_range(10.0..25.0),
    };

    (0..count)
        .map(|i| {
            let steps_back = (count - 1 - i) as i32;
            level += rng.gen_range(-1.5..1.5);
            let value = if rng.gen_bool(0.02) {
                rng.gen_range(-50.0..100.0) // 2% outliers
            } else {
                level
            };

            let (moisture, temperature) = match device_type {
                DeviceType::Moisture => (Some(value.clamp(0.0, 100.0)), None),
                _ => (None, Some(value)),
            };

            Reading {
                device_id: device_id.to_string(),
                ts: end - interval * steps_back,
                moisture,
                temperature,
            }
        })
        .collect()
}
