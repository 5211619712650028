//! Per-entity validation rule lists.
//!
//! Rules are declared once while building the mapping and never change
//! afterwards. Evaluation reports, for every invalid field, the message of
//! the first rule that failed for it.

use crate::error::ValidationError;
use crate::value::{Value, ValueKind};
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A single field rule: the predicate must hold, otherwise `message` is reported.
#[derive(Clone)]
pub struct Rule {
    field: String,
    message: String,
    check: Predicate,
}

impl Rule {
    pub fn new<P>(field: impl Into<String>, message: impl Into<String>, check: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            message: message.into(),
            check: Arc::new(check),
        }
    }

    /// Field must be present: not NULL and not empty text.
    pub fn presence(field: impl Into<String>) -> Self {
        Self::new(field, "cannot be blank", |v| !v.is_blank())
    }

    /// Field must hold a value of the given kind. NULL passes.
    pub fn kind(field: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(field, format!("should be {}", kind.as_str()), move |v| {
            v.is_null() || kind.matches(v)
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn check(&self, value: &Value) -> bool {
        (self.check)(value)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("field", &self.field)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Ordered, immutable list of rules for one entity type.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Evaluate every rule against the values produced by `lookup`.
    ///
    /// A field the lookup cannot resolve is checked as NULL.
    pub fn evaluate<F>(&self, entity: &str, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let mut errors = ValidationError::new(entity);
        for rule in &self.rules {
            if errors.message_for(&rule.field).is_some() {
                continue;
            }
            let value = lookup(&rule.field).unwrap_or(Value::Null);
            if !rule.check(&value) {
                errors.add(rule.field.clone(), rule.message.clone());
            }
        }
        errors.into_result()
    }
}
