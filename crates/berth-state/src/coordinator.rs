//! The single task that owns the topology and decides every lease.

use crate::filter::FilterPredicate;
use crate::lease::{select_node, LeaseKind, LeaseOptions, LeaseRequest};
use crate::ledger::{Ledger, UpsertOutcome};
use crate::subscriber::Observed;
use crate::{Result, StateError};
use berth_core::{Ingress, Node, NodeResources, Resource, Volume};
use berth_storage::Registry;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Aggregate capacity of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSummary {
    pub nodes: usize,
    pub ready_nodes: usize,
    /// Summed over schedulable nodes only
    pub capacity: NodeResources,
    pub allocated: NodeResources,
}

/// Read-only questions answered from the coordinator's current view
#[derive(Debug)]
pub enum Query {
    Node {
        name: String,
        reply: oneshot::Sender<Option<Node>>,
    },
    Nodes(oneshot::Sender<Vec<Node>>),
    Volumes(oneshot::Sender<Vec<Volume>>),
    Ingresses(oneshot::Sender<Vec<Ingress>>),
    Summary(oneshot::Sender<ClusterSummary>),
}

/// Sending halves of every coordinator queue
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub nodes: mpsc::Sender<Observed<Node>>,
    pub volumes: mpsc::Sender<Observed<Volume>>,
    pub ingresses: mpsc::Sender<Observed<Ingress>>,
    pub releases: mpsc::Sender<LeaseRequest>,
    pub leases: mpsc::Sender<LeaseRequest>,
    pub queries: mpsc::Sender<Query>,
}

struct Inbox {
    nodes: mpsc::Receiver<Observed<Node>>,
    volumes: mpsc::Receiver<Observed<Volume>>,
    ingresses: mpsc::Receiver<Observed<Ingress>>,
    releases: mpsc::Receiver<LeaseRequest>,
    leases: mpsc::Receiver<LeaseRequest>,
    queries: mpsc::Receiver<Query>,
}

pub struct Coordinator {
    registry: Registry,
    filters: Vec<Box<dyn FilterPredicate>>,
    nodes: Ledger<Node>,
    volumes: Ledger<Volume>,
    ingresses: Ledger<Ingress>,
    inbox: Inbox,
}

impl Coordinator {
    /// Create a coordinator and the handle that feeds it. Every queue holds at
    /// most `capacity` pending messages.
    pub fn new(
        registry: Registry,
        filters: Vec<Box<dyn FilterPredicate>>,
        capacity: usize,
    ) -> (Self, CoordinatorHandle) {
        let capacity = capacity.max(1);
        let (nodes_tx, nodes_rx) = mpsc::channel(capacity);
        let (volumes_tx, volumes_rx) = mpsc::channel(capacity);
        let (ingresses_tx, ingresses_rx) = mpsc::channel(capacity);
        let (releases_tx, releases_rx) = mpsc::channel(capacity);
        let (leases_tx, leases_rx) = mpsc::channel(capacity);
        let (queries_tx, queries_rx) = mpsc::channel(capacity);

        let coordinator = Self {
            registry,
            filters,
            nodes: Ledger::new(),
            volumes: Ledger::new(),
            ingresses: Ledger::new(),
            inbox: Inbox {
                nodes: nodes_rx,
                volumes: volumes_rx,
                ingresses: ingresses_rx,
                releases: releases_rx,
                leases: leases_rx,
                queries: queries_rx,
            },
        };

        let handle = CoordinatorHandle {
            nodes: nodes_tx,
            volumes: volumes_tx,
            ingresses: ingresses_tx,
            releases: releases_tx,
            leases: leases_tx,
            queries: queries_tx,
        };

        (coordinator, handle)
    }

    /// Serve requests until cancelled or every handle is dropped.
    ///
    /// Topology updates are drained before releases, releases before leases,
    /// so a lease always sees the freshest view the coordinator has.
    pub async fn run(mut self, token: CancellationToken) {
        info!("Starting lease coordinator");

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("Lease coordinator shutting down");
                    break;
                }
                Some(update) = self.inbox.nodes.recv() => self.apply_node(update),
                Some(update) = self.inbox.volumes.recv() => apply(&mut self.volumes, update),
                Some(update) = self.inbox.ingresses.recv() => apply(&mut self.ingresses, update),
                Some(request) = self.inbox.releases.recv() => self.handle(request),
                Some(request) = self.inbox.leases.recv() => self.handle(request),
                Some(query) = self.inbox.queries.recv() => self.answer(query),
                else => {
                    info!("All coordinator handles dropped");
                    break;
                }
            }
        }
    }

    fn apply_node(&mut self, update: Observed<Node>) {
        if let Observed::Upsert(node) = &update {
            debug!(
                "Node {} update: phase={} capacity=({})",
                node.name(),
                node.status.phase,
                node.status.capacity
            );
        }
        apply(&mut self.nodes, update);
    }

    fn handle(&mut self, request: LeaseRequest) {
        let LeaseRequest {
            kind,
            options,
            reply,
        } = request;

        // The caller timed out and was already told the request failed
        if reply.is_closed() {
            debug!(
                "Requester stopped waiting, skipping {:?} of {}",
                kind,
                options.demand()
            );
            return;
        }

        let result = match kind {
            LeaseKind::Lease => self.lease(&options),
            LeaseKind::Release => self.release(&options),
        };

        match &result {
            Ok(node) => info!(
                "{:?} of {} on node {} done (allocated {})",
                kind,
                options.demand(),
                node.name(),
                node.status.allocated
            ),
            Err(e) => warn!("{:?} of {} failed: {}", kind, options.demand(), e),
        }

        match reply.send(result) {
            Ok(()) => {}
            Err(Ok(node)) if kind == LeaseKind::Lease => {
                warn!(
                    "Requester of lease on node {} went away, releasing it",
                    node.name()
                );
                self.undo_lease(node.name(), &options);
            }
            Err(_) => debug!("Requester stopped waiting for {:?} reply", kind),
        }
    }

    /// Give back a lease nobody received
    fn undo_lease(&mut self, name: &str, options: &LeaseOptions) {
        let demand = options.demand();
        if let Err(e) = self.commit(name, |node| {
            node.status.allocated = node.status.allocated.saturating_sub(&demand);
        }) {
            error!("Failed to undo unclaimed lease on node {}: {}", name, e);
        }
    }

    fn lease(&mut self, options: &LeaseOptions) -> Result<Node> {
        options.validate()?;

        let name = select_node(&self.nodes, &self.filters, options)?
            .name()
            .to_string();
        let demand = options.demand();

        self.commit(&name, |node| {
            node.status.allocated = node.status.allocated.saturating_add(&demand);
        })
    }

    fn release(&mut self, options: &LeaseOptions) -> Result<Node> {
        options.validate()?;

        let name = options.node.as_deref().ok_or_else(|| {
            StateError::invalid_request(
                "release does not name a node",
                "Set the node the lease was granted on",
            )
        })?;
        let demand = options.demand();

        self.commit(name, |node| {
            node.status.allocated = node.status.allocated.saturating_sub(&demand);
        })
    }

    /// Apply `change` to a node and persist it. The ledger only keeps the
    /// change once it is stored.
    fn commit(&mut self, name: &str, change: impl FnOnce(&mut Node)) -> Result<Node> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| StateError::node_not_found(name))?;

        let previous = node.clone();
        change(node);

        match self.registry.put(node.clone()) {
            Ok(stored) => {
                *node = stored.clone();
                Ok(stored)
            }
            Err(e) => {
                error!("Failed to persist node {}: {}", name, e);
                *node = previous;
                Err(StateError::backend_unavailable(e.to_string()))
            }
        }
    }

    fn answer(&self, query: Query) {
        // A dropped receiver only means the caller went away
        match query {
            Query::Node { name, reply } => {
                let _ = reply.send(self.nodes.get(&name).cloned());
            }
            Query::Nodes(reply) => {
                let _ = reply.send(self.nodes.list());
            }
            Query::Volumes(reply) => {
                let _ = reply.send(self.volumes.list());
            }
            Query::Ingresses(reply) => {
                let _ = reply.send(self.ingresses.list());
            }
            Query::Summary(reply) => {
                let _ = reply.send(self.summary());
            }
        }
    }

    fn summary(&self) -> ClusterSummary {
        let mut summary = ClusterSummary {
            nodes: self.nodes.len(),
            ..Default::default()
        };

        for node in self.nodes.iter().filter(|n| n.is_schedulable()) {
            summary.ready_nodes += 1;
            summary.capacity = summary.capacity.saturating_add(&node.status.capacity);
            summary.allocated = summary.allocated.saturating_add(&node.status.allocated);
        }

        summary
    }
}

fn apply<T: Resource>(ledger: &mut Ledger<T>, update: Observed<T>) {
    match update {
        Observed::Upsert(object) => {
            let name = object.display_name().to_string();
            match ledger.upsert(object) {
                UpsertOutcome::Inserted => info!("{} {} added", T::KIND, name),
                UpsertOutcome::Updated => debug!("{} {} updated", T::KIND, name),
                UpsertOutcome::Stale => {}
            }
        }
        Observed::Remove { key, revision } => {
            if ledger.remove(&key, revision).is_some() {
                info!("{} {} removed", T::KIND, key);
            }
        }
        Observed::Resync { items, revision } => {
            let removed = ledger.resync(items, revision);
            info!(
                "{} view resynced at revision {}: {} held, {} dropped",
                T::KIND,
                revision,
                ledger.len(),
                removed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::default_filters;
    use berth_storage::{RedbBackend, RevisionedStore, StoreConfig};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_coordinator(dir: &std::path::Path) -> (Coordinator, CoordinatorHandle, Registry) {
        let kv = Arc::new(RedbBackend::new(dir.join("test.redb")).unwrap());
        let registry = Registry::new(Arc::new(
            RevisionedStore::new(kv, StoreConfig::default()).unwrap(),
        ));
        let (coordinator, handle) = Coordinator::new(registry.clone(), default_filters(), 16);
        (coordinator, handle, registry)
    }

    fn create_test_node(name: &str, memory: i64) -> Node {
        Node::new(name, NodeResources::new(0, memory, 0))
    }

    #[test]
    fn test_lease_persists_and_stamps_revision() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1024)));

        let node = coordinator.lease(&LeaseOptions::new().memory(600)).unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 600);
        assert_eq!(node.revision(), Some(1));

        let stored: Node = registry.get(&node.resource_key().unwrap()).unwrap().unwrap();
        assert_eq!(stored.status.allocated.memory_bytes, 600);

        // The echo of our own write is stale
        apply(&mut coordinator.nodes, Observed::Upsert(stored));
        assert_eq!(
            coordinator.nodes.get("node-a").unwrap().status.allocated.memory_bytes,
            600
        );
    }

    #[test]
    fn test_lease_release_restores_ledger() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, _registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1024)));
        let before = coordinator.nodes.get("node-a").unwrap().status.clone();

        let options = LeaseOptions::new().memory(300).cpu(250);
        let node = coordinator.lease(&options).unwrap();
        coordinator
            .release(&options.clone().on_node(node.name()))
            .unwrap();

        assert_eq!(coordinator.nodes.get("node-a").unwrap().status, before);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, _registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1024)));

        coordinator.lease(&LeaseOptions::new().memory(100)).unwrap();
        let node = coordinator
            .release(&LeaseOptions::new().on_node("node-a").memory(500))
            .unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 0);

        let err = coordinator.release(&LeaseOptions::new().memory(1)).unwrap_err();
        assert!(matches!(err, StateError::InvalidRequest { .. }));

        let err = coordinator
            .release(&LeaseOptions::new().on_node("node-z"))
            .unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound { .. }));
    }

    #[test]
    fn test_removed_node_cannot_be_leased() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, _registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1024)));
        apply(
            &mut coordinator.nodes,
            Observed::Remove {
                key: "node-a".to_string(),
                revision: None,
            },
        );

        let err = coordinator
            .lease(&LeaseOptions::new().on_node("node-a"))
            .unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound { .. }));
    }

    #[test]
    fn test_abandoned_lease_is_skipped() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1000)));

        let (request, rx) = LeaseRequest::new(LeaseKind::Lease, LeaseOptions::new().memory(600));
        drop(rx);
        coordinator.handle(request);

        let node = coordinator.nodes.get("node-a").unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 0);
        assert_eq!(
            registry
                .get::<Node>(&node.resource_key().unwrap())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, _registry) = create_test_coordinator(dir.path());
        // Accepted by the ledger, rejected by the registry's name validation
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("Node_A", 1024)));

        let err = coordinator
            .lease(&LeaseOptions::new().on_node("Node_A").memory(100))
            .unwrap_err();
        assert!(matches!(err, StateError::BackendUnavailable { .. }));
        assert_eq!(
            coordinator.nodes.get("Node_A").unwrap().status.allocated,
            NodeResources::default()
        );

        let (request, mut rx) =
            LeaseRequest::new(LeaseKind::Lease, LeaseOptions::new().memory(100));
        coordinator.handle(request);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(StateError::BackendUnavailable { .. })
        ));
        assert_eq!(
            coordinator.nodes.get("Node_A").unwrap().status.allocated,
            NodeResources::default()
        );
    }

    #[test]
    fn test_summary_counts_schedulable_nodes() {
        let dir = tempdir().unwrap();
        let (mut coordinator, _handle, _registry) = create_test_coordinator(dir.path());
        apply(&mut coordinator.nodes, Observed::Upsert(create_test_node("node-a", 1024)));
        let mut cordoned = create_test_node("node-b", 512);
        cordoned.spec.unschedulable = true;
        apply(&mut coordinator.nodes, Observed::Upsert(cordoned));

        coordinator.lease(&LeaseOptions::new().memory(24)).unwrap();

        let summary = coordinator.summary();
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.ready_nodes, 1);
        assert_eq!(summary.capacity.memory_bytes, 1024);
        assert_eq!(summary.allocated.memory_bytes, 24);
    }

    #[tokio::test]
    async fn test_run_answers_queued_requests() {
        let dir = tempdir().unwrap();
        let (coordinator, handle, _registry) = create_test_coordinator(dir.path());
        let token = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(token.clone()));

        handle
            .nodes
            .send(Observed::Upsert(create_test_node("node-a", 1024)))
            .await
            .unwrap();

        let (request, rx) = LeaseRequest::new(LeaseKind::Lease, LeaseOptions::new().memory(512));
        handle.leases.send(request).await.unwrap();
        let node = rx.await.unwrap().unwrap();
        assert_eq!(node.name(), "node-a");

        let (reply, rx) = oneshot::channel();
        handle.queries.send(Query::Summary(reply)).await.unwrap();
        assert_eq!(rx.await.unwrap().allocated.memory_bytes, 512);

        token.cancel();
        task.await.unwrap();
    }
}
