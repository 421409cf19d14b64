//! Device startup times against each device's historical average.

use serde::Serialize;

use super::Trend;
use crate::model::{DeviceId, DeviceStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupTime {
    pub device_id: DeviceId,
    pub device_name: String,
    pub startup_time: u64,
    pub hist_avg_startup_time: u64,
    /// `None` when the device has no earlier runs to compare against.
    pub delta: Option<i64>,
    pub trend: Trend,
}

/// Startup time per device. Lower is better. Devices without a measured
/// startup are left out.
pub fn startup_deltas(statuses: &[DeviceStatus]) -> Vec<StartupTime> {
    statuses
        .iter()
        .filter(|s| s.startup_time > 0)
        .map(|s| {
            let delta = (s.hist_avg_startup_time > 0)
                .then(|| s.startup_time as i64 - s.hist_avg_startup_time as i64);
            let trend = delta.map_or(Trend::Unchanged, |d| Trend::classify(d as f64, false));
            StartupTime {
                device_id: s.device_id,
                device_name: s
                    .device
                    .as_ref()
                    .map(|d| d.display_name().to_string())
                    .unwrap_or_else(|| format!("device {}", s.device_id)),
                startup_time: s.startup_time,
                hist_avg_startup_time: s.hist_avg_startup_time,
                delta,
                trend,
            }
        })
        .collect()
}
