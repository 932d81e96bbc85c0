//! How an async projection picks the instant it materializes at.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entry::EventEntry;

pub type AsOfFn = dyn Fn(&EventEntry) -> Option<DateTime<Utc>> + Send + Sync;

/// As-of resolution strategy for an async projection registration.
#[derive(Clone, Default)]
pub enum AsOf {
    /// Creation time of the most recent event in the stream.
    #[default]
    LastEventTime,
    /// Left unresolved; the background executor uses its own execution time.
    JobTime,
    /// Computed from the most recent entry. Returning `None` is a configuration error.
    Custom(Arc<AsOfFn>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AsOfError {
    #[error("custom as-of strategy returned no timestamp for {event_type} (version {version})")]
    NoTimestamp { event_type: String, version: u64 },
}

impl AsOf {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&EventEntry) -> Option<DateTime<Utc>> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Resolve against the most recent entry.
    ///
    /// `Ok(None)` means "resolve at execution time".
    pub fn resolve(&self, last: &EventEntry) -> Result<Option<DateTime<Utc>>, AsOfError> {
        match self {
            AsOf::LastEventTime => Ok(Some(last.created_at)),
            AsOf::JobTime => Ok(None),
            AsOf::Custom(f) => f(last).map(Some).ok_or_else(|| AsOfError::NoTimestamp {
                event_type: last.event_type.clone(),
                version: last.version,
            }),
        }
    }
}

impl core::fmt::Debug for AsOf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AsOf::LastEventTime => f.write_str("LastEventTime"),
            AsOf::JobTime => f.write_str("JobTime"),
            AsOf::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_core::EntityId;
    use serde_json::json;

    fn entry_at(created_at: DateTime<Utc>) -> EventEntry {
        EventEntry {
            entity_id: EntityId::new(),
            version: 4,
            event_type: "counter.added".to_string(),
            attributes: json!({ "value": 1 }),
            created_at,
        }
    }

    #[test]
    fn last_event_time_uses_entry_creation_time() {
        let at = Utc::now();
        assert_eq!(AsOf::LastEventTime.resolve(&entry_at(at)), Ok(Some(at)));
    }

    #[test]
    fn job_time_is_left_unresolved() {
        assert_eq!(AsOf::JobTime.resolve(&entry_at(Utc::now())), Ok(None));
    }

    #[test]
    fn custom_strategy_is_applied_to_last_entry() {
        let at = Utc::now();
        let strategy = AsOf::custom(|e| Some(e.created_at + chrono::Duration::hours(1)));
        assert_eq!(
            strategy.resolve(&entry_at(at)),
            Ok(Some(at + chrono::Duration::hours(1)))
        );
    }

    #[test]
    fn custom_strategy_without_timestamp_is_an_error() {
        let strategy = AsOf::custom(|_| None);
        let err = strategy.resolve(&entry_at(Utc::now())).unwrap_err();
        assert_eq!(
            err,
            AsOfError::NoTimestamp {
                event_type: "counter.added".to_string(),
                version: 4
            }
        );
    }
}
