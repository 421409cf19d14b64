//! Status digest of a protocol's log: latest screenshot, latest step,
//! step count, and the error lines.

use serde::Serialize;

use crate::model::{EntrySource, LogLevel, ProtocolEntry};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSummary {
    pub last_screen: Option<ProtocolEntry>,
    pub last_step: Option<ProtocolEntry>,
    pub steps: usize,
    /// Newest first.
    pub errors: Vec<ProtocolEntry>,
    /// Newest first.
    pub screens: Vec<ProtocolEntry>,
}

impl ProtocolSummary {
    pub fn from_entries(entries: &[ProtocolEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries.iter().rev() {
            match entry.source {
                EntrySource::Screen => {
                    if summary.last_screen.is_none() {
                        summary.last_screen = Some(entry.clone());
                    }
                    summary.screens.push(entry.clone());
                }
                EntrySource::Step => {
                    if summary.last_step.is_none() {
                        summary.last_step = Some(entry.clone());
                    }
                    summary.steps += 1;
                }
                _ => {}
            }
            if entry.level == LogLevel::Error {
                summary.errors.push(entry.clone());
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, source: EntrySource, level: LogLevel) -> ProtocolEntry {
        ProtocolEntry {
            id,
            test_protocol_id: 1,
            source,
            level,
            message: format!("entry {}", id),
            data: String::new(),
            created_at: Default::default(),
        }
    }

    #[test]
    fn test_summary_picks_latest() {
        let entries = vec![
            entry(1, EntrySource::Step, LogLevel::Info),
            entry(2, EntrySource::Screen, LogLevel::Info),
            entry(3, EntrySource::App, LogLevel::Error),
            entry(4, EntrySource::Step, LogLevel::Info),
            entry(5, EntrySource::Screen, LogLevel::Info),
            entry(6, EntrySource::Step, LogLevel::Error),
        ];
        let s = ProtocolSummary::from_entries(&entries);

        assert_eq!(s.steps, 3);
        assert_eq!(s.last_step.as_ref().map(|e| e.id), Some(6));
        assert_eq!(s.last_screen.as_ref().map(|e| e.id), Some(5));
        assert_eq!(s.screens.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 2]);
        assert_eq!(s.errors.iter().map(|e| e.id).collect::<Vec<_>>(), vec![6, 3]);
    }

    #[test]
    fn test_first_entry_is_counted() {
        let s = ProtocolSummary::from_entries(&[entry(1, EntrySource::Step, LogLevel::Info)]);
        assert_eq!(s.steps, 1);
        assert!(s.last_screen.is_none());
    }

    #[test]
    fn test_empty_log() {
        assert_eq!(ProtocolSummary::from_entries(&[]), ProtocolSummary::default());
    }
}
