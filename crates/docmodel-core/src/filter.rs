//! Record predicates for relation reads and predicate writes.

use crate::value::{Record, Value, ValueKey};
use serde::{Deserialize, Serialize};

/// A predicate over stored records.
///
/// A missing field compares equal to [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Matches every record
    All,
    /// `field == value`
    Eq(String, Value),
    /// `field IN values`
    In(String, Vec<Value>),
    /// Every sub-filter matches
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Conjunction, flattening nested `And`s and dropping `All`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for filter in [self, other] {
            match filter {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                f => parts.push(f),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.pop().unwrap_or(Filter::All),
            _ => Filter::And(parts),
        }
    }

    /// Conjunction with an optional filter.
    #[must_use]
    pub fn and_opt(self, other: Option<&Filter>) -> Self {
        match other {
            Some(f) => self.and(f.clone()),
            None => self,
        }
    }

    /// Does `record` satisfy this filter?
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => {
                let actual = record.get(field).unwrap_or(&Value::Null);
                ValueKey::new(actual) == ValueKey::new(value)
            }
            Filter::In(field, values) => {
                let actual = ValueKey::new(record.get(field).unwrap_or(&Value::Null));
                values.iter().any(|v| ValueKey::new(v) == actual)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn eq_treats_missing_as_null() {
        let r = record! { "a" => 1 };
        assert!(Filter::eq("a", 1).matches(&r));
        assert!(Filter::eq("b", Value::Null).matches(&r));
        assert!(!Filter::eq("a", 2).matches(&r));
    }

    #[test]
    fn in_list_and_conjunction() {
        let r = record! { "postId" => 3, "kind" => "x" };
        let f = Filter::in_list("postId", vec![Value::Int(1), Value::Int(3)])
            .and(Filter::eq("kind", "x"));
        assert!(f.matches(&r));
        assert!(!Filter::in_list("postId", Vec::new()).matches(&r));
    }

    #[test]
    fn and_flattens_and_drops_all() {
        let f = Filter::All.and(Filter::eq("a", 1));
        assert_eq!(f, Filter::eq("a", 1));
        let f = Filter::eq("a", 1)
            .and(Filter::eq("b", 2))
            .and(Filter::eq("c", 3));
        assert!(matches!(f, Filter::And(ref parts) if parts.len() == 3));
    }
}
