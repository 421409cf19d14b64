//! Test runs and their run-level log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AppBinaryRef, DeviceStatus, RunId, TestProtocol, TestResultState};

/// One execution request against a test definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: RunId,
    #[serde(default)]
    pub test_id: u64,
    #[serde(default)]
    pub app_binary_id: u64,
    #[serde(default)]
    pub app_binary: Option<AppBinaryRef>,
    /// Environment parameters, `;`-separated.
    #[serde(default)]
    pub parameter: String,
    #[serde(default)]
    pub test_result: TestResultState,
    #[serde(default)]
    pub log: Vec<RunLogEntry>,
    #[serde(default)]
    pub device_status: Vec<DeviceStatus>,
    #[serde(default)]
    pub protocols: Vec<TestProtocol>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl TestRun {
    pub fn environment_parameters(&self) -> Vec<&str> {
        self.parameter
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub test_run_id: RunId,
    #[serde(default)]
    pub level: String,
    #[serde(default, alias = "log")]
    pub message: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}
