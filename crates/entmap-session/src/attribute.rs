//! Baseline values for change detection.

use entmap_core::Value;
use std::collections::BTreeSet;

/// Identifiers of a collection's members at a point in time.
///
/// Members that have not been inserted yet have no identifier and are
/// counted in `pending` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberIds {
    ids: BTreeSet<i64>,
    pending: usize,
}

impl MemberIds {
    pub fn from_ids<I: IntoIterator<Item = Option<i64>>>(ids: I) -> Self {
        let mut members = Self::default();
        for id in ids {
            match id {
                Some(id) => {
                    members.ids.insert(id);
                }
                None => members.pending += 1,
            }
        }
        members
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: i64) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: i64) {
        self.ids.remove(&id);
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.ids.iter().copied()
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.pending == 0
    }

    /// Ids present here but missing from `current`.
    pub fn removed_from(&self, current: &MemberIds) -> Vec<i64> {
        self.ids.difference(&current.ids).copied().collect()
    }
}

/// The value an attribute holds.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Scalar(Value),
    Members(MemberIds),
}

/// An attribute name paired with its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    name: String,
    baseline: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, baseline: AttributeValue) -> Self {
        Self {
            name: name.into(),
            baseline,
        }
    }

    pub fn scalar(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, AttributeValue::Scalar(value))
    }

    pub fn members(name: impl Into<String>, ids: MemberIds) -> Self {
        Self::new(name, AttributeValue::Members(ids))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baseline(&self) -> &AttributeValue {
        &self.baseline
    }

    /// Whether `current` differs from the baseline.
    ///
    /// Scalars compare by value. Member sets compare by id set; any
    /// pending member counts as a change.
    pub fn changed(&self, current: &AttributeValue) -> bool {
        match (&self.baseline, current) {
            (AttributeValue::Scalar(before), AttributeValue::Scalar(now)) => before != now,
            (AttributeValue::Members(before), AttributeValue::Members(now)) => {
                now.pending > 0 || before.ids != now.ids
            }
            _ => true,
        }
    }

    pub fn changed_scalar(&self, current: &Value) -> bool {
        match &self.baseline {
            AttributeValue::Scalar(before) => before != current,
            AttributeValue::Members(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[Option<i64>]) -> AttributeValue {
        AttributeValue::Members(MemberIds::from_ids(ids.iter().copied()))
    }

    #[test]
    fn test_scalar_changed() {
        let attr = Attribute::scalar("name", Value::from("basic"));
        assert!(!attr.changed(&AttributeValue::Scalar(Value::from("basic"))));
        assert!(attr.changed(&AttributeValue::Scalar(Value::from("business"))));
        assert!(attr.changed(&AttributeValue::Scalar(Value::Null)));
        assert!(!attr.changed_scalar(&Value::from("basic")));
    }

    #[test]
    fn test_members_unchanged_regardless_of_order() {
        let attr = Attribute::new("groups", members(&[Some(1), Some(2)]));
        assert!(!attr.changed(&members(&[Some(2), Some(1)])));
    }

    #[test]
    fn test_members_added() {
        let attr = Attribute::new("groups", members(&[Some(1), Some(2)]));
        assert!(attr.changed(&members(&[Some(1), Some(2), Some(3)])));
    }

    #[test]
    fn test_members_removed() {
        let attr = Attribute::new("groups", members(&[Some(1), Some(2)]));
        assert!(attr.changed(&members(&[Some(1)])));
    }

    #[test]
    fn test_members_replaced() {
        let attr = Attribute::new("groups", members(&[Some(1), Some(2)]));
        assert!(attr.changed(&members(&[Some(1), Some(3)])));
    }

    #[test]
    fn test_pending_member_is_a_change() {
        let attr = Attribute::new("groups", members(&[Some(1)]));
        assert!(attr.changed(&members(&[Some(1), None])));
    }

    #[test]
    fn test_removed_from() {
        let before = MemberIds::from_ids([Some(1), Some(2), Some(3)]);
        let now = MemberIds::from_ids([Some(2), None]);
        assert_eq!(before.removed_from(&now), vec![1, 3]);
        assert_eq!(now.pending(), 1);
    }
}
