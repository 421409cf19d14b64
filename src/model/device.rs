//! Device and app-binary references.
//!
//! A run only looks these up. The one field the aggregator touches is the
//! device status code, which is flipped by push notifications.

use serde::{Deserialize, Serialize};

use super::DeviceId;

/// A device as embedded in run and protocol records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceRef {
    pub id: DeviceId,
    pub identifier: String,
    pub name: String,
    pub alias: String,
    pub os: String,
    pub os_version: String,
    pub status: i64,
}

impl DeviceRef {
    /// The alias when one is set, otherwise the device name.
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }
}

/// Per-run device record with the measured startup time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device: Option<DeviceRef>,
    /// Status code as last pushed by the hub.
    #[serde(default)]
    pub status: i64,
    /// Startup time in milliseconds.
    #[serde(default)]
    pub startup_time: u64,
    /// Average startup time of the same device over previous runs (ms), 0 when unknown.
    #[serde(default)]
    pub hist_avg_startup_time: u64,
}

/// The app binary a run was executed against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppBinaryRef {
    pub id: u64,
    pub name: String,
    pub identifier: String,
    pub platform: String,
    pub version: String,
    pub hash: String,
    pub additional: String,
}
