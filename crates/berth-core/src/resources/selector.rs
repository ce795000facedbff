use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placement constraints a candidate node must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Pin to a single node by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Every label must be present on the node with an equal value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Returns the first selector label the node does not satisfy
    pub fn first_mismatch<'a>(
        &'a self,
        node_labels: Option<&BTreeMap<String, String>>,
    ) -> Option<(&'a str, &'a str)> {
        self.labels
            .iter()
            .find(|(key, value)| node_labels.and_then(|l| l.get(*key)) != Some(*value))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, node_labels: Option<&BTreeMap<String, String>>) -> bool {
        self.first_mismatch(node_labels).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_anything() {
        let selector = Selector::default();
        assert!(selector.matches(None));
        assert!(selector.matches(Some(&labels(&[("disk", "ssd")]))));
    }

    #[test]
    fn test_selector_mismatch() {
        let selector = Selector {
            node: None,
            labels: labels(&[("disk", "ssd"), ("zone", "a")]),
        };

        assert!(selector.matches(Some(&labels(&[("disk", "ssd"), ("zone", "a"), ("x", "y")]))));
        assert_eq!(
            selector.first_mismatch(Some(&labels(&[("disk", "ssd"), ("zone", "b")]))),
            Some(("zone", "a"))
        );
        assert!(!selector.matches(None));
    }
}
