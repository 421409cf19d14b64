//! Dismissible, time-limited user-facing messages.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(message: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Notices in posting order.
#[derive(Debug, Default, Clone)]
pub struct NoticeBoard {
    notices: Vec<Notice>,
}

impl NoticeBoard {
    pub fn post(&mut self, notice: Notice) -> Uuid {
        let id = notice.id;
        self.notices.push(notice);
        id
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<Notice> {
        self.notices
            .iter()
            .filter(|n| !n.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.notices.len();
        self.notices.retain(|n| n.id != id);
        self.notices.len() != before
    }

    /// Drop expired notices, returning how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.notices.len();
        self.notices.retain(|n| !n.is_expired(now));
        before - self.notices.len()
    }
}
