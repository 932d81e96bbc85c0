//! Outcome of an append attempt.

use chrono::{DateTime, Utc};

use eventline_core::ValidationErrors;

/// A candidate event annotated with the outcome of `append`.
///
/// Two independent error channels are kept:
/// - `own_errors`: the event's own schema/rules rejected it
/// - `state_errors`: the history with this event appended is not acceptable
///   (consistency projection invalid, racing writer, failed transactional work)
///
/// [`errors`](AppendedEvent::errors) is the merged view of both.
#[derive(Debug, Clone)]
pub struct AppendedEvent<E> {
    event: E,
    version: Option<u64>,
    created_at: Option<DateTime<Utc>>,
    own_errors: ValidationErrors,
    state_errors: ValidationErrors,
}

impl<E> AppendedEvent<E> {
    pub fn new(event: E) -> Self {
        Self {
            event,
            version: None,
            created_at: None,
            own_errors: ValidationErrors::new(),
            state_errors: ValidationErrors::new(),
        }
    }

    pub fn with_own_errors(mut self, errors: ValidationErrors) -> Self {
        self.own_errors = errors;
        self
    }

    pub fn with_state_errors(mut self, errors: ValidationErrors) -> Self {
        self.state_errors = errors;
        self
    }

    /// Attach a record-level error to the state channel.
    pub fn with_base_error(mut self, message: impl Into<String>) -> Self {
        self.state_errors.add_base(message);
        self
    }

    pub fn persisted(mut self, version: u64, created_at: DateTime<Utc>) -> Self {
        self.version = Some(version);
        self.created_at = Some(created_at);
        self
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn into_event(self) -> E {
        self.event
    }

    /// Assigned version, only set once the entry is committed.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn own_errors(&self) -> &ValidationErrors {
        &self.own_errors
    }

    pub fn state_errors(&self) -> &ValidationErrors {
        &self.state_errors
    }

    /// Own errors followed by state errors.
    pub fn errors(&self) -> ValidationErrors {
        let mut merged = self.own_errors.clone();
        merged.merge(&self.state_errors);
        merged
    }

    pub fn is_valid(&self) -> bool {
        self.own_errors.is_empty() && self.state_errors.is_empty()
    }

    pub fn is_persisted(&self) -> bool {
        self.version.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_core::BASE;

    #[test]
    fn fresh_event_is_valid_but_not_persisted() {
        let appended = AppendedEvent::new("start");
        assert!(appended.is_valid());
        assert!(!appended.is_persisted());
        assert!(appended.errors().is_empty());
    }

    #[test]
    fn merged_view_contains_both_channels() {
        let appended = AppendedEvent::new(())
            .with_own_errors(ValidationErrors::new().with("value", "is too small"))
            .with_base_error("racing condition");

        assert!(!appended.is_valid());
        let merged = appended.errors();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(BASE), ["racing condition".to_string()]);
        assert_eq!(appended.own_errors().len(), 1);
        assert_eq!(appended.state_errors().len(), 1);
    }

    #[test]
    fn persisted_records_version_and_time() {
        let now = Utc::now();
        let appended = AppendedEvent::new(()).persisted(3, now);
        assert_eq!(appended.version(), Some(3));
        assert_eq!(appended.created_at(), Some(now));
    }
}
