//! Composable predicates over persisted events.
//!
//! A [`MetadataMatcher`] is an ordered list of constraints that a load
//! operation applies on top of the position bounds. Each constraint inspects
//! either a key of the event metadata object or one of the envelope columns
//! (`event_id`, `event_name`, `created_at`) and compares it with a fixed
//! value using one of the [`Operator`]s.
//!
//! Constraints are validated at construction time: field names are restricted
//! to a safe character set, operators come from a closed enum, and values must
//! fit the operator. Storage backends translate the constraints into SQL;
//! [`MetadataMatcher::matches`] evaluates them in memory, which is what the
//! in-memory test store uses.
use crate::envelope::EventEnvelope;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Comparison operator of a single constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    In,
    LowerThan,
    LowerThanEquals,
    NotIn,
    Regex,
}

/// Which part of a persisted event a constraint inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A key of the event metadata object.
    Metadata,
    /// A column of the envelope itself: `event_id`, `event_name`, or
    /// `created_at`.
    Property,
}

/// A single `(field, operator, value)` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    field: String,
    operator: Operator,
    value: Value,
    kind: FieldKind,
}

impl Constraint {
    /// The inspected field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The comparison operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// The value compared against.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the constraint inspects metadata or an envelope column.
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Evaluates the constraint against an envelope in memory.
    ///
    /// A missing metadata key never matches, regardless of the operator.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        let actual = match self.kind {
            FieldKind::Metadata => match event.metadata_value(&self.field) {
                Some(value) => value.clone(),
                None => return false,
            },
            FieldKind::Property => match self.field.as_str() {
                "event_id" => Value::String(event.event_id().to_string()),
                "event_name" => Value::String(event.event_name().to_string()),
                "created_at" => Value::String(event.format_created_at()),
                _ => return false,
            },
        };
        match self.operator {
            Operator::Equals => actual == self.value,
            Operator::NotEquals => actual != self.value,
            Operator::GreaterThan => compare(&actual, &self.value) == Some(Ordering::Greater),
            Operator::GreaterThanEquals => {
                matches!(compare(&actual, &self.value), Some(Ordering::Greater | Ordering::Equal))
            }
            Operator::LowerThan => compare(&actual, &self.value) == Some(Ordering::Less),
            Operator::LowerThanEquals => {
                matches!(compare(&actual, &self.value), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::In => self.value.as_array().is_some_and(|items| items.contains(&actual)),
            Operator::NotIn => self.value.as_array().is_some_and(|items| !items.contains(&actual)),
            Operator::Regex => match (actual.as_str(), self.value.as_str()) {
                // The pattern was compiled once at construction time.
                (Some(actual), Some(pattern)) => Regex::new(pattern)
                    .map(|re| re.is_match(actual))
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(actual), Value::Number(expected)) => {
            actual.as_f64()?.partial_cmp(&expected.as_f64()?)
        }
        (Value::String(actual), Value::String(expected)) => Some(actual.as_str().cmp(expected)),
        _ => None,
    }
}

/// Error returned when a matcher constraint fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatcherError {
    /// The field name contains characters outside `[A-Za-z0-9_.-]`, or an
    /// unknown envelope column was addressed.
    #[error("invalid matcher field {0:?}")]
    InvalidField(String),
    /// `In` and `NotIn` require an array of scalar values.
    #[error("IN and NOT IN require an array of scalar values")]
    ExpectedArray,
    /// `Regex` requires a string pattern.
    #[error("REGEX requires a string pattern")]
    ExpectedPattern,
    /// The regex pattern does not compile.
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),
    /// Comparison operators require a string, number, or boolean value.
    #[error("matcher values must be strings, numbers, or booleans")]
    UnsupportedValue,
}

const PROPERTY_FIELDS: &[&str] = &["event_id", "event_name", "created_at"];

/// An ordered conjunction of [`Constraint`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMatcher {
    constraints: Vec<Constraint>,
}

impl MetadataMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint over a metadata key.
    ///
    /// # Errors
    ///
    /// Returns a `MatcherError` if the field name or the value does not fit
    /// the operator.
    pub fn with(
        self,
        field: impl Into<String>,
        operator: Operator,
        value: Value,
    ) -> Result<Self, MatcherError> {
        lazy_static! {
            static ref FIELD_RE: Regex = Regex::new("^[A-Za-z0-9_.-]+$").unwrap();
        }
        let field = field.into();
        if !FIELD_RE.is_match(&field) {
            return Err(MatcherError::InvalidField(field));
        }
        self.push(field, operator, value, FieldKind::Metadata)
    }

    /// Adds a constraint over an envelope column: `event_id`, `event_name`,
    /// or `created_at`.
    pub fn with_property(
        self,
        field: impl Into<String>,
        operator: Operator,
        value: Value,
    ) -> Result<Self, MatcherError> {
        let field = field.into();
        if !PROPERTY_FIELDS.contains(&field.as_str()) {
            return Err(MatcherError::InvalidField(field));
        }
        self.push(field, operator, value, FieldKind::Property)
    }

    fn push(
        mut self,
        field: String,
        operator: Operator,
        value: Value,
        kind: FieldKind,
    ) -> Result<Self, MatcherError> {
        check_value(operator, &value)?;
        self.constraints.push(Constraint {
            field,
            operator,
            value,
            kind,
        });
        Ok(self)
    }

    /// The constraints in insertion order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Evaluates every constraint against an envelope in memory.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        self.constraints.iter().all(|constraint| constraint.matches(event))
    }
}

fn check_value(operator: Operator, value: &Value) -> Result<(), MatcherError> {
    match operator {
        Operator::In | Operator::NotIn => match value.as_array() {
            Some(items) if !items.is_empty() && items.iter().all(is_scalar) => Ok(()),
            _ => Err(MatcherError::ExpectedArray),
        },
        Operator::Regex => {
            let pattern = value.as_str().ok_or(MatcherError::ExpectedPattern)?;
            Regex::new(pattern)
                .map(|_| ())
                .map_err(|err| MatcherError::InvalidPattern(err.to_string()))
        }
        _ => {
            if is_scalar(value) {
                Ok(())
            } else {
                Err(MatcherError::UnsupportedValue)
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> EventEnvelope {
        EventEnvelope::new("UserCreated", json!({ "name": "Sasha" }))
            .with_metadata_entry("_aggregate_type", json!("user"))
            .with_metadata_entry("_aggregate_version", json!(5))
            .with_metadata_entry("admin", json!(true))
    }

    #[test]
    fn it_rejects_unsafe_field_names() {
        let err = MetadataMatcher::new()
            .with("bad field'; --", Operator::Equals, json!("x"))
            .unwrap_err();
        assert!(matches!(err, MatcherError::InvalidField(_)));
    }

    #[test]
    fn it_rejects_unknown_property_fields() {
        let err = MetadataMatcher::new()
            .with_property("payload", Operator::Equals, json!("x"))
            .unwrap_err();
        assert_eq!(err, MatcherError::InvalidField("payload".to_string()));
    }

    #[test]
    fn it_requires_an_array_for_in_operators() {
        let err = MetadataMatcher::new()
            .with("role", Operator::In, json!("admin"))
            .unwrap_err();
        assert_eq!(err, MatcherError::ExpectedArray);
    }

    #[test]
    fn it_requires_a_valid_regex_pattern() {
        let err = MetadataMatcher::new()
            .with("name", Operator::Regex, json!("(unclosed"))
            .unwrap_err();
        assert!(matches!(err, MatcherError::InvalidPattern(_)));
    }

    #[test]
    fn it_rejects_structured_values() {
        let err = MetadataMatcher::new()
            .with("nested", Operator::Equals, json!({ "a": 1 }))
            .unwrap_err();
        assert_eq!(err, MatcherError::UnsupportedValue);
    }

    #[test]
    fn it_matches_metadata_equality() {
        let matcher = MetadataMatcher::new()
            .with("_aggregate_type", Operator::Equals, json!("user"))
            .unwrap();
        assert!(matcher.matches(&event()));

        let matcher = MetadataMatcher::new()
            .with("_aggregate_type", Operator::Equals, json!("order"))
            .unwrap();
        assert!(!matcher.matches(&event()));
    }

    #[test]
    fn it_never_matches_a_missing_metadata_key() {
        let matcher = MetadataMatcher::new()
            .with("missing", Operator::NotEquals, json!("x"))
            .unwrap();
        assert!(!matcher.matches(&event()));
    }

    #[test]
    fn it_compares_numbers() {
        let matcher = MetadataMatcher::new()
            .with("_aggregate_version", Operator::GreaterThan, json!(4))
            .unwrap()
            .with("_aggregate_version", Operator::LowerThanEquals, json!(5))
            .unwrap();
        assert!(matcher.matches(&event()));

        let matcher = MetadataMatcher::new()
            .with("_aggregate_version", Operator::LowerThan, json!(5))
            .unwrap();
        assert!(!matcher.matches(&event()));
    }

    #[test]
    fn it_matches_booleans() {
        let matcher = MetadataMatcher::new()
            .with("admin", Operator::Equals, json!(true))
            .unwrap();
        assert!(matcher.matches(&event()));
    }

    #[test]
    fn it_matches_value_lists() {
        let matcher = MetadataMatcher::new()
            .with("_aggregate_type", Operator::In, json!(["user", "guest"]))
            .unwrap();
        assert!(matcher.matches(&event()));

        let matcher = MetadataMatcher::new()
            .with("_aggregate_type", Operator::NotIn, json!(["order"]))
            .unwrap();
        assert!(matcher.matches(&event()));
    }

    #[test]
    fn it_matches_regex_patterns() {
        let matcher = MetadataMatcher::new()
            .with("_aggregate_type", Operator::Regex, json!("^us"))
            .unwrap();
        assert!(matcher.matches(&event()));
    }

    #[test]
    fn it_matches_envelope_properties() {
        let matcher = MetadataMatcher::new()
            .with_property("event_name", Operator::Equals, json!("UserCreated"))
            .unwrap();
        assert!(matcher.matches(&event()));

        let matcher = MetadataMatcher::new()
            .with_property("created_at", Operator::GreaterThan, json!("2020-01-01T00:00:00.000000"))
            .unwrap();
        assert!(matcher.matches(&event()));
    }
}
