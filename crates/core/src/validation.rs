//! Structured, field-level validation errors.
//!
//! Errors are grouped by field name. Failures that do not belong to a single
//! field are recorded under [`BASE`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Field key used for errors that concern the record as a whole.
pub const BASE: &str = "base";

/// Field name → ordered list of messages.
///
/// Ordering is deterministic (fields sorted by name, messages in insertion
/// order) so two equal error sets always render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    errors: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message against `field`.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Record a message that concerns the record as a whole.
    pub fn add_base(&mut self, message: impl Into<String>) {
        self.add(BASE, message);
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.add(field, message);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of messages across all fields.
    pub fn len(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    /// Messages recorded against `field` (empty if none).
    pub fn get(&self, field: &str) -> &[String] {
        self.errors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.errors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.errors
            .iter()
            .flat_map(|(field, msgs)| msgs.iter().map(move |m| (field.as_str(), m.as_str())))
    }

    /// Append every message of `other`, keeping existing messages first.
    pub fn merge(&mut self, other: &ValidationErrors) {
        for (field, message) in other.iter() {
            self.add(field, message);
        }
    }

    /// Human-readable messages: `"<field> <message>"`, or just the message for [`BASE`].
    pub fn full_messages(&self) -> Vec<String> {
        self.iter()
            .map(|(field, message)| {
                if field == BASE {
                    message.to_string()
                } else {
                    format!("{field} {message}")
                }
            })
            .collect()
    }

    /// `Ok(())` when empty, otherwise the errors themselves.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_messages().join(", "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Types that can check their own attributes.
pub trait Validate {
    fn validate(&self) -> ValidationErrors;

    fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_messages_by_field() {
        let mut errors = ValidationErrors::new();
        errors.add("value", "must be greater than or equal to 0");
        errors.add("value", "must be even");
        errors.add("name", "can't be blank");

        assert_eq!(errors.len(), 3);
        assert_eq!(errors.get("value").len(), 2);
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["name", "value"]);
        assert!(errors.get("missing").is_empty());
    }

    #[test]
    fn base_messages_render_without_field_prefix() {
        let errors = ValidationErrors::new()
            .with("value", "is invalid")
            .with(BASE, "racing condition");

        assert_eq!(
            errors.full_messages(),
            vec!["racing condition".to_string(), "value is invalid".to_string()]
        );
        assert_eq!(errors.to_string(), "racing condition, value is invalid");
    }

    #[test]
    fn merge_keeps_existing_messages_first() {
        let mut own = ValidationErrors::new().with("value", "first");
        let state = ValidationErrors::new().with("value", "second").with(BASE, "third");

        own.merge(&state);

        assert_eq!(own.get("value"), ["first".to_string(), "second".to_string()]);
        assert_eq!(own.get(BASE), ["third".to_string()]);
    }

    #[test]
    fn into_result_reflects_emptiness() {
        assert!(ValidationErrors::new().into_result().is_ok());
        assert!(ValidationErrors::new().with("a", "b").into_result().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                .. ProptestConfig::default()
            })]

            #[test]
            fn merged_length_is_sum_of_parts(
                left in proptest::collection::vec(("[a-c]", "[a-z]{1,4}"), 0..8),
                right in proptest::collection::vec(("[a-c]", "[a-z]{1,4}"), 0..8),
            ) {
                let mut a = ValidationErrors::new();
                for (f, m) in &left { a.add(f.clone(), m.clone()); }
                let mut b = ValidationErrors::new();
                for (f, m) in &right { b.add(f.clone(), m.clone()); }

                let expected = a.len() + b.len();
                a.merge(&b);
                prop_assert_eq!(a.len(), expected);
            }
        }
    }
}
