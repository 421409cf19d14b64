//! Initial run state: the snapshot contract and its file and HTTP loaders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::model::{ProtocolId, RunId, TestProtocol, TestRun};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("hub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hub returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("snapshot holds run {found}, requested run {requested}")]
    RunMismatch { requested: RunId, found: RunId },

    #[error("{0} not found")]
    NotFound(String),
}

/// `{run, nextRunId, prevRunId}` as served by the hub's run endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    #[serde(alias = "testRun")]
    pub run: TestRun,
    #[serde(default)]
    pub next_run_id: Option<RunId>,
    #[serde(default)]
    pub prev_run_id: Option<RunId>,
}

impl RunSnapshot {
    pub fn new(run: TestRun) -> Self {
        Self {
            run,
            next_run_id: None,
            prev_run_id: None,
        }
    }
}

/// `{protocols}` as served by the hub's protocol endpoint: the requested
/// protocol including its history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSnapshot {
    #[serde(default)]
    pub protocols: Vec<TestProtocol>,
}

#[async_trait::async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SnapshotError>;

    async fn load_protocol(
        &self,
        run_id: RunId,
        protocol_id: ProtocolId,
    ) -> Result<ProtocolSnapshot, SnapshotError>;
}

fn parse<T: serde::de::DeserializeOwned>(origin: &str, body: &[u8]) -> Result<T, SnapshotError> {
    serde_json::from_slice(body).map_err(|source| SnapshotError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn check_run(requested: RunId, snapshot: RunSnapshot) -> Result<RunSnapshot, SnapshotError> {
    if snapshot.run.id == requested {
        Ok(snapshot)
    } else {
        Err(SnapshotError::RunMismatch {
            requested,
            found: snapshot.run.id,
        })
    }
}

// ---------------------------------------------------------------------------
// File loader
// ---------------------------------------------------------------------------

/// Reads snapshots from disk.
///
/// `root` is either a single run snapshot file, or a directory holding
/// `run_{id}.json` and optionally `protocol_{id}.json` files.
#[derive(Debug, Clone)]
pub struct FileSnapshotLoader {
    root: PathBuf,
}

impl FileSnapshotLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(path: &Path) -> Result<Vec<u8>, SnapshotError> {
        tokio::fs::read(path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SnapshotError::NotFound(path.display().to_string())
            } else {
                SnapshotError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
    }

    async fn read_run_file(&self, path: &Path) -> Result<RunSnapshot, SnapshotError> {
        let body = Self::read(path).await?;
        parse(&path.display().to_string(), &body)
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        if self.root.is_dir() {
            self.root.join(format!("run_{}.json", run_id))
        } else {
            self.root.clone()
        }
    }

    /// Run identity held by a single-file snapshot.
    pub async fn peek_run_id(&self) -> Result<RunId, SnapshotError> {
        if self.root.is_dir() {
            return Err(SnapshotError::NotFound(format!(
                "run id for directory {}",
                self.root.display()
            )));
        }
        Ok(self.read_run_file(&self.root).await?.run.id)
    }
}

#[async_trait::async_trait]
impl SnapshotLoader for FileSnapshotLoader {
    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SnapshotError> {
        let path = self.run_path(run_id);
        debug!(run_id, path = %path.display(), "Loading run snapshot from file");
        let snapshot = check_run(run_id, self.read_run_file(&path).await?)?;
        info!(
            run_id,
            protocols = snapshot.run.protocols.len(),
            "Loaded run snapshot"
        );
        Ok(snapshot)
    }

    async fn load_protocol(
        &self,
        run_id: RunId,
        protocol_id: ProtocolId,
    ) -> Result<ProtocolSnapshot, SnapshotError> {
        if self.root.is_dir() {
            let path = self.root.join(format!("protocol_{}.json", protocol_id));
            if path.exists() {
                let body = Self::read(&path).await?;
                return parse(&path.display().to_string(), &body);
            }
        }

        // Fall back to the record embedded in the run snapshot.
        let snapshot = self.load_run(run_id).await?;
        let protocols: Vec<TestProtocol> = snapshot
            .run
            .protocols
            .into_iter()
            .filter(|p| p.id == protocol_id)
            .take(1)
            .collect();
        if protocols.is_empty() {
            return Err(SnapshotError::NotFound(format!("protocol {}", protocol_id)));
        }
        Ok(ProtocolSnapshot { protocols })
    }
}

// ---------------------------------------------------------------------------
// HTTP loader
// ---------------------------------------------------------------------------

/// Fetches snapshots from the hub's REST API.
#[derive(Debug, Clone)]
pub struct HttpSnapshotLoader {
    client: reqwest::Client,
    hub: HubConfig,
}

impl HttpSnapshotLoader {
    pub fn new(hub: HubConfig) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(hub.request_timeout())
            .build()?;
        Ok(Self { client, hub })
    }

    pub fn run_url(&self, run_id: RunId) -> String {
        format!(
            "{}/api/{}/app/{}/test/{}/run/{}",
            self.hub.base_url.trim_end_matches('/'),
            self.hub.project,
            self.hub.app_id,
            self.hub.test_id,
            run_id
        )
    }

    pub fn protocol_url(&self, run_id: RunId, protocol_id: ProtocolId) -> String {
        format!("{}/{}", self.run_url(run_id), protocol_id)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, SnapshotError> {
        debug!(%url, "Fetching snapshot");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SnapshotError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(SnapshotError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl SnapshotLoader for HttpSnapshotLoader {
    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SnapshotError> {
        let url = self.run_url(run_id);
        let body = self.get(&url).await?;
        check_run(run_id, parse(&url, &body)?)
    }

    async fn load_protocol(
        &self,
        run_id: RunId,
        protocol_id: ProtocolId,
    ) -> Result<ProtocolSnapshot, SnapshotError> {
        let url = self.protocol_url(run_id, protocol_id);
        let body = self.get(&url).await?;
        parse(&url, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_7: &str = r#"{
        "testRun": {
            "id": 7,
            "protocols": [
                {"id": 70, "testRunId": 7, "testResult": "success"},
                {"id": 71, "testRunId": 7}
            ]
        },
        "nextRunId": 8,
        "prevRunId": null
    }"#;

    #[test]
    fn test_single_file_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, RUN_7).unwrap();
        let loader = FileSnapshotLoader::new(&path);

        let snapshot = tokio_test::block_on(loader.load_run(7)).unwrap();
        assert_eq!(snapshot.run.protocols.len(), 2);
        assert_eq!(snapshot.next_run_id, Some(8));
        assert_eq!(snapshot.prev_run_id, None);
        assert_eq!(tokio_test::block_on(loader.peek_run_id()).unwrap(), 7);

        let mismatch = tokio_test::block_on(loader.load_run(9));
        assert!(matches!(
            mismatch,
            Err(SnapshotError::RunMismatch {
                requested: 9,
                found: 7
            })
        ));
    }

    #[test]
    fn test_directory_loader_and_protocol_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run_7.json"), RUN_7).unwrap();
        let loader = FileSnapshotLoader::new(dir.path());

        let snapshot = tokio_test::block_on(loader.load_run(7)).unwrap();
        assert_eq!(snapshot.run.id, 7);

        let protocol = tokio_test::block_on(loader.load_protocol(7, 71)).unwrap();
        assert_eq!(protocol.protocols.len(), 1);
        assert_eq!(protocol.protocols[0].id, 71);

        assert!(matches!(
            tokio_test::block_on(loader.load_protocol(7, 99)),
            Err(SnapshotError::NotFound(_))
        ));
        assert!(matches!(
            tokio_test::block_on(loader.load_run(8)),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn test_malformed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"run\": [").unwrap();
        let result = tokio_test::block_on(FileSnapshotLoader::new(&path).load_run(1));
        assert!(matches!(result, Err(SnapshotError::Parse { .. })));
    }

    #[test]
    fn test_hub_urls() {
        let loader = HttpSnapshotLoader::new(HubConfig {
            base_url: "http://hub.local:8080/".to_string(),
            project: "racing".to_string(),
            app_id: 3,
            test_id: 12,
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(
            loader.run_url(42),
            "http://hub.local:8080/api/racing/app/3/test/12/run/42"
        );
        assert_eq!(
            loader.protocol_url(42, 420),
            "http://hub.local:8080/api/racing/app/3/test/12/run/42/420"
        );
    }
}
