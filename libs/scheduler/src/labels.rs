//! Provisionable labels.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A set of optional worker dimensions.
///
/// A request's labels describe the configuration it would like; a worker's
/// labels describe the configuration it already has. A worker whose labels
/// are a superset of the request's can run it without provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every label in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &LabelSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", joined.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_is_subset_of_anything() {
        let empty = LabelSet::new();
        let some: LabelSet = ["gpu", "linux"].into_iter().collect();
        assert!(empty.is_subset_of(&some));
        assert!(empty.is_subset_of(&empty));
        assert!(!some.is_subset_of(&empty));
    }

    #[test]
    fn test_display_sorted() {
        let labels: LabelSet = ["b", "a"].into_iter().collect();
        assert_eq!(labels.to_string(), "{a,b}");
    }

    #[test]
    fn test_serializes_as_array() {
        let labels: LabelSet = ["L1"].into_iter().collect();
        assert_eq!(serde_json::to_string(&labels).unwrap(), "[\"L1\"]");
    }
}
