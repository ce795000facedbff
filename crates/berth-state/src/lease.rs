use crate::filter::{evaluate, FilterFailure, FilterPredicate};
use crate::ledger::Ledger;
use crate::{Result, StateError};
use berth_core::{Node, NodeResources};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::debug;

/// What to lease (or release) and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseOptions {
    /// Pin the request to one node
    pub node: Option<String>,
    /// Labels the node must carry
    pub selector: BTreeMap<String, String>,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
}

impl LeaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_node(mut self, name: impl Into<String>) -> Self {
        self.node = Some(name.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }

    pub fn cpu(mut self, millicores: i64) -> Self {
        self.cpu_millicores = millicores;
        self
    }

    pub fn memory(mut self, bytes: i64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn storage(mut self, bytes: i64) -> Self {
        self.storage_bytes = bytes;
        self
    }

    /// The resource vector this request adds to (or removes from) a node
    pub fn demand(&self) -> NodeResources {
        NodeResources::new(self.cpu_millicores, self.memory_bytes, self.storage_bytes)
    }

    pub fn validate(&self) -> Result<()> {
        if self.demand().is_negative() {
            return Err(StateError::invalid_request(
                format!("negative amounts in request ({})", self.demand()),
                "Lease amounts must be zero or positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Lease,
    Release,
}

/// A queued lease or release. The reply sender is consumed by the answer.
#[derive(Debug)]
pub struct LeaseRequest {
    pub kind: LeaseKind,
    pub options: LeaseOptions,
    pub reply: oneshot::Sender<Result<Node>>,
}

impl LeaseRequest {
    pub fn new(kind: LeaseKind, options: LeaseOptions) -> (Self, oneshot::Receiver<Result<Node>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                kind,
                options,
                reply,
            },
            rx,
        )
    }
}

/// Pick the node a lease lands on.
///
/// A pinned request only considers its node. Otherwise the first node in
/// ascending name order that passes every filter wins.
pub fn select_node<'a>(
    ledger: &'a Ledger<Node>,
    filters: &[Box<dyn FilterPredicate>],
    options: &LeaseOptions,
) -> Result<&'a Node> {
    if let Some(name) = &options.node {
        let node = ledger
            .get(name)
            .ok_or_else(|| StateError::node_not_found(name.clone()))?;

        let result = evaluate(filters, options, node);
        return match result.failure {
            None => Ok(node),
            Some(FilterFailure::Unmatched) => Err(StateError::no_matching_node(result.describe())),
            Some(FilterFailure::Insufficient) => {
                Err(StateError::no_resource_available(result.describe()))
            }
        };
    }

    if ledger.is_empty() {
        return Err(StateError::no_matching_node("no nodes are registered"));
    }

    let mut unmatched = Vec::new();
    let mut insufficient = Vec::new();

    for node in ledger.iter() {
        let result = evaluate(filters, options, node);
        match result.failure {
            None => {
                debug!("Selected node {} for {}", node.name(), options.demand());
                return Ok(node);
            }
            Some(FilterFailure::Unmatched) => unmatched.push(result.describe()),
            Some(FilterFailure::Insufficient) => insufficient.push(result.describe()),
        }
    }

    // Some node matched the constraints but had no room
    if !insufficient.is_empty() {
        Err(StateError::no_resource_available(insufficient.join("; ")))
    } else {
        Err(StateError::no_matching_node(unmatched.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::default_filters;
    use berth_core::NodePhase;

    fn create_test_ledger(nodes: &[(&str, i64)]) -> Ledger<Node> {
        let mut ledger = Ledger::new();
        for (name, memory) in nodes {
            ledger.upsert(Node::new(*name, NodeResources::new(0, *memory, 0)));
        }
        ledger
    }

    #[test]
    fn test_first_fit_in_name_order() {
        let ledger = create_test_ledger(&[("node-b", 4096), ("node-a", 4096)]);
        let node = select_node(&ledger, &default_filters(), &LeaseOptions::new().memory(100)).unwrap();
        assert_eq!(node.name(), "node-a");
    }

    #[test]
    fn test_skips_nodes_without_room() {
        let mut ledger = create_test_ledger(&[("node-a", 1024), ("node-b", 512)]);
        ledger.get_mut("node-a").unwrap().status.allocated.memory_bytes = 600;

        let node = select_node(&ledger, &default_filters(), &LeaseOptions::new().memory(500)).unwrap();
        assert_eq!(node.name(), "node-b");
    }

    #[test]
    fn test_empty_ledger_is_no_matching_node() {
        let ledger = Ledger::new();
        let err = select_node(&ledger, &default_filters(), &LeaseOptions::new().memory(1)).unwrap_err();
        assert!(matches!(err, StateError::NoMatchingNode { .. }));
    }

    #[test]
    fn test_insufficient_beats_unmatched() {
        let mut ledger = create_test_ledger(&[("node-a", 100), ("node-b", 4096)]);
        ledger.get_mut("node-b").unwrap().status.phase = NodePhase::NotReady;

        let err = select_node(&ledger, &default_filters(), &LeaseOptions::new().memory(200)).unwrap_err();
        assert!(matches!(err, StateError::NoResourceAvailable { .. }));
    }

    #[test]
    fn test_selector_without_match() {
        let ledger = create_test_ledger(&[("node-a", 4096)]);
        let options = LeaseOptions::new().with_label("disk", "ssd");

        let err = select_node(&ledger, &default_filters(), &options).unwrap_err();
        assert!(matches!(err, StateError::NoMatchingNode { .. }));
    }

    #[test]
    fn test_pinned_node() {
        let ledger = create_test_ledger(&[("node-a", 4096), ("node-b", 128)]);

        let node = select_node(&ledger, &default_filters(), &LeaseOptions::new().on_node("node-b")).unwrap();
        assert_eq!(node.name(), "node-b");

        let err = select_node(
            &ledger,
            &default_filters(),
            &LeaseOptions::new().on_node("node-b").memory(256),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::NoResourceAvailable { .. }));

        let err = select_node(&ledger, &default_filters(), &LeaseOptions::new().on_node("node-z")).unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound { .. }));
    }

    #[test]
    fn test_negative_amounts_rejected() {
        let err = LeaseOptions::new().memory(-1).validate().unwrap_err();
        assert!(matches!(err, StateError::InvalidRequest { .. }));
    }
}
