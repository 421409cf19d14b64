//! Push notifications: topic addressing, payload shapes, and decoding.
//!
//! The hub publishes one message per topic. A raw message is the topic name
//! plus an untyped JSON payload; [`decode`] turns it into a [`PushEvent`] or
//! explains why it cannot be used. Undecodable messages are dropped by the
//! apply loop, never retried.

pub mod replay;
pub mod source;

pub use self::replay::ReplayEventSource;
pub use self::source::{channel, ChannelEventSource, EventPublisher, EventSource};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    DeviceId, ProtocolEntry, ProtocolId, RunId, RunLogEntry, TestProtocol, TestResultState,
};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("malformed payload on {topic}: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload on {topic} addresses {found}, expected {expected}")]
    TopicMismatch {
        topic: String,
        expected: u64,
        found: u64,
    },

    #[error("run completion on {topic} carries no result")]
    MissingResult { topic: String },

    #[error("event source closed")]
    Closed,

    #[error("failed to read event stream: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A push channel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `test_run_{id}_log`
    RunLog(RunId),
    /// `test_run_{id}_protocol`
    RunProtocol(RunId),
    /// `test_run_{id}_finished`
    RunFinished(RunId),
    /// `test_protocol_{id}_log`
    ProtocolLog(ProtocolId),
    /// `test_protocol_{id}_protocol`, targeted updates for one protocol.
    ProtocolUpdate(ProtocolId),
    /// `devices`
    Devices,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::RunLog(id) => write!(f, "test_run_{}_log", id),
            Topic::RunProtocol(id) => write!(f, "test_run_{}_protocol", id),
            Topic::RunFinished(id) => write!(f, "test_run_{}_finished", id),
            Topic::ProtocolLog(id) => write!(f, "test_protocol_{}_log", id),
            Topic::ProtocolUpdate(id) => write!(f, "test_protocol_{}_protocol", id),
            Topic::Devices => write!(f, "devices"),
        }
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "devices" {
            return Ok(Topic::Devices);
        }
        let unknown = || EventError::UnknownTopic(s.to_string());

        let (rest, is_run) = if let Some(rest) = s.strip_prefix("test_run_") {
            (rest, true)
        } else if let Some(rest) = s.strip_prefix("test_protocol_") {
            (rest, false)
        } else {
            return Err(unknown());
        };

        let (id, kind) = rest.split_once('_').ok_or_else(unknown)?;
        let id: u64 = id.parse().map_err(|_| unknown())?;

        match (is_run, kind) {
            (true, "log") => Ok(Topic::RunLog(id)),
            (true, "protocol") => Ok(Topic::RunProtocol(id)),
            (true, "finished") => Ok(Topic::RunFinished(id)),
            (false, "log") => Ok(Topic::ProtocolLog(id)),
            (false, "protocol") => Ok(Topic::ProtocolUpdate(id)),
            _ => Err(unknown()),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogPayload {
    pub test_run_id: RunId,
    pub entry: RunLogEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolPayload {
    /// Falls back to the protocol's own run reference when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<RunId>,
    pub protocol: TestProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolLogPayload {
    pub test_protocol_id: ProtocolId,
    pub entry: ProtocolEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinishedPayload {
    pub test_run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TestResultState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub unstable: u32,
}

impl RunFinishedPayload {
    /// An explicit result wins; otherwise the hub's counters decide.
    fn resolve(&self) -> Option<TestResultState> {
        if let Some(result) = self.result {
            return Some(result);
        }
        if self.failed > 0 {
            Some(TestResultState::Failed)
        } else if self.unstable > 0 {
            Some(TestResultState::Unstable)
        } else {
            self.success.map(|ok| {
                if ok {
                    TestResultState::Success
                } else {
                    TestResultState::Failed
                }
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusPayload {
    pub device_id: DeviceId,
    #[serde(alias = "deviceState")]
    pub status: i64,
}

// ---------------------------------------------------------------------------
// PushEvent / RawMessage
// ---------------------------------------------------------------------------

/// A decoded push notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    RunLog {
        run_id: RunId,
        entry: RunLogEntry,
    },
    Protocol {
        run_id: RunId,
        protocol: TestProtocol,
    },
    ProtocolLog {
        protocol_id: ProtocolId,
        entry: ProtocolEntry,
    },
    RunFinished {
        run_id: RunId,
        result: TestResultState,
    },
    DeviceStatus {
        device_id: DeviceId,
        status: i64,
    },
}

impl PushEvent {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            PushEvent::RunLog { run_id, .. } => Topic::RunLog(*run_id),
            PushEvent::Protocol { run_id, .. } => Topic::RunProtocol(*run_id),
            PushEvent::ProtocolLog { protocol_id, .. } => Topic::ProtocolLog(*protocol_id),
            PushEvent::RunFinished { run_id, .. } => Topic::RunFinished(*run_id),
            PushEvent::DeviceStatus { .. } => Topic::Devices,
        }
    }

    /// Encode as the raw message the hub would publish.
    pub fn to_raw(&self) -> RawMessage {
        let payload = match self {
            PushEvent::RunLog { run_id, entry } => serde_json::to_value(RunLogPayload {
                test_run_id: *run_id,
                entry: entry.clone(),
            }),
            PushEvent::Protocol { run_id, protocol } => serde_json::to_value(ProtocolPayload {
                test_run_id: Some(*run_id),
                protocol: protocol.clone(),
            }),
            PushEvent::ProtocolLog { protocol_id, entry } => {
                serde_json::to_value(ProtocolLogPayload {
                    test_protocol_id: *protocol_id,
                    entry: entry.clone(),
                })
            }
            PushEvent::RunFinished { run_id, result } => serde_json::to_value(RunFinishedPayload {
                test_run_id: *run_id,
                result: Some(*result),
                success: None,
                failed: 0,
                unstable: 0,
            }),
            PushEvent::DeviceStatus { device_id, status } => {
                serde_json::to_value(DeviceStatusPayload {
                    device_id: *device_id,
                    status: *status,
                })
            }
        };
        RawMessage {
            topic: self.topic().to_string(),
            // Plain data structs always serialize.
            payload: payload.unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A message as it comes off the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn parse_payload<T: serde::de::DeserializeOwned>(raw: &RawMessage) -> Result<T, EventError> {
    serde_json::from_value(raw.payload.clone()).map_err(|source| EventError::Payload {
        topic: raw.topic.clone(),
        source,
    })
}

fn ensure_addressed(topic: &str, expected: u64, found: u64) -> Result<(), EventError> {
    if expected == found {
        Ok(())
    } else {
        Err(EventError::TopicMismatch {
            topic: topic.to_string(),
            expected,
            found,
        })
    }
}

/// Decode a raw message. The topic is authoritative: a payload addressing a
/// different run or protocol than its topic is rejected.
pub fn decode(raw: &RawMessage) -> Result<PushEvent, EventError> {
    let topic: Topic = raw.topic.parse()?;
    match topic {
        Topic::RunLog(run_id) => {
            let p: RunLogPayload = parse_payload(raw)?;
            ensure_addressed(&raw.topic, run_id, p.test_run_id)?;
            Ok(PushEvent::RunLog {
                run_id,
                entry: p.entry,
            })
        }
        Topic::RunProtocol(run_id) => {
            let p: ProtocolPayload = parse_payload(raw)?;
            // 0 means the hub left the run unset; the topic supplies it.
            let found = p
                .test_run_id
                .filter(|id| *id != 0)
                .unwrap_or(p.protocol.test_run_id);
            if found != 0 {
                ensure_addressed(&raw.topic, run_id, found)?;
            }
            Ok(PushEvent::Protocol {
                run_id,
                protocol: p.protocol,
            })
        }
        Topic::ProtocolUpdate(protocol_id) => {
            let p: ProtocolPayload = parse_payload(raw)?;
            ensure_addressed(&raw.topic, protocol_id, p.protocol.id)?;
            Ok(PushEvent::Protocol {
                run_id: p.test_run_id.unwrap_or(p.protocol.test_run_id),
                protocol: p.protocol,
            })
        }
        Topic::ProtocolLog(protocol_id) => {
            let p: ProtocolLogPayload = parse_payload(raw)?;
            ensure_addressed(&raw.topic, protocol_id, p.test_protocol_id)?;
            Ok(PushEvent::ProtocolLog {
                protocol_id,
                entry: p.entry,
            })
        }
        Topic::RunFinished(run_id) => {
            let p: RunFinishedPayload = parse_payload(raw)?;
            ensure_addressed(&raw.topic, run_id, p.test_run_id)?;
            let result = p.resolve().ok_or_else(|| EventError::MissingResult {
                topic: raw.topic.clone(),
            })?;
            Ok(PushEvent::RunFinished { run_id, result })
        }
        Topic::Devices => {
            let p: DeviceStatusPayload = parse_payload(raw)?;
            Ok(PushEvent::DeviceStatus {
                device_id: p.device_id,
                status: p.status,
            })
        }
    }
}
