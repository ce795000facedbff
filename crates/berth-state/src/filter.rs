use crate::lease::LeaseOptions;
use berth_core::{Node, Selector};
use tracing::debug;

/// Why a node failed a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFailure {
    /// Node does not satisfy the placement constraints
    Unmatched,
    /// Node matches but lacks room
    Insufficient,
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub node_name: String,
    /// `None` when the node passed
    pub failure: Option<FilterFailure>,
    pub reason: Option<String>,
}

impl FilterResult {
    pub fn pass(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            failure: None,
            reason: None,
        }
    }

    pub fn fail(node_name: impl Into<String>, failure: FilterFailure, reason: String) -> Self {
        Self {
            node_name: node_name.into(),
            failure: Some(failure),
            reason: Some(reason),
        }
    }

    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// "node: reason", for error messages
    pub fn describe(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{}: {}", self.node_name, reason),
            None => self.node_name.clone(),
        }
    }
}

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a node for the given request
    fn filter(&self, request: &LeaseOptions, node: &Node) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Node is Ready and not cordoned
pub struct NodeSchedulable;

impl FilterPredicate for NodeSchedulable {
    fn filter(&self, _request: &LeaseOptions, node: &Node) -> FilterResult {
        if node.spec.unschedulable {
            return FilterResult::fail(
                node.name(),
                FilterFailure::Unmatched,
                "Node is unschedulable".to_string(),
            );
        }

        if !node.is_schedulable() {
            return FilterResult::fail(
                node.name(),
                FilterFailure::Unmatched,
                format!("Node is {}", node.status.phase),
            );
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeSchedulable"
    }
}

/// Every selector label is present on the node with the same value
pub struct NodeSelectorMatch;

impl FilterPredicate for NodeSelectorMatch {
    fn filter(&self, request: &LeaseOptions, node: &Node) -> FilterResult {
        if request.selector.is_empty() {
            return FilterResult::pass(node.name());
        }

        let selector = Selector {
            node: None,
            labels: request.selector.clone(),
        };

        match selector.first_mismatch(node.labels()) {
            Some((key, value)) => FilterResult::fail(
                node.name(),
                FilterFailure::Unmatched,
                format!("Node selector mismatch: {}={}", key, value),
            ),
            None => FilterResult::pass(node.name()),
        }
    }

    fn name(&self) -> &str {
        "NodeSelectorMatch"
    }
}

/// What is left on the node covers the request on every dimension
pub struct NodeFitsResources;

impl FilterPredicate for NodeFitsResources {
    fn filter(&self, request: &LeaseOptions, node: &Node) -> FilterResult {
        let available = node.allocatable();
        let demand = request.demand();

        debug!(
            "Node {} has {} available, request needs {}",
            node.name(),
            available,
            demand
        );

        if demand.cpu_millicores > available.cpu_millicores {
            return FilterResult::fail(
                node.name(),
                FilterFailure::Insufficient,
                format!(
                    "Insufficient CPU: requested {} milli, available {} milli",
                    demand.cpu_millicores, available.cpu_millicores
                ),
            );
        }

        if demand.memory_bytes > available.memory_bytes {
            return FilterResult::fail(
                node.name(),
                FilterFailure::Insufficient,
                format!(
                    "Insufficient memory: requested {} bytes, available {} bytes",
                    demand.memory_bytes, available.memory_bytes
                ),
            );
        }

        if demand.storage_bytes > available.storage_bytes {
            return FilterResult::fail(
                node.name(),
                FilterFailure::Insufficient,
                format!(
                    "Insufficient storage: requested {} bytes, available {} bytes",
                    demand.storage_bytes, available.storage_bytes
                ),
            );
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeFitsResources"
    }
}

/// Get default filter predicates, in evaluation order
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![
        Box::new(NodeSchedulable),
        Box::new(NodeSelectorMatch),
        Box::new(NodeFitsResources),
    ]
}

/// Run the filters in order; the first failure wins
pub fn evaluate(filters: &[Box<dyn FilterPredicate>], request: &LeaseOptions, node: &Node) -> FilterResult {
    for filter in filters {
        let result = filter.filter(request, node);
        if !result.passed() {
            debug!(
                "Filter {} rejected node {}: {:?}",
                filter.name(),
                node.name(),
                result.reason
            );
            return result;
        }
    }
    FilterResult::pass(node.name())
}
