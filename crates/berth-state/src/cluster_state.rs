use crate::coordinator::{ClusterSummary, Coordinator, CoordinatorHandle, Query};
use crate::filter::default_filters;
use crate::ipam::Ipam;
use crate::lease::{LeaseKind, LeaseOptions, LeaseRequest};
use crate::subscriber::{ChangeSubscriber, Observed, SubscriberConfig, SubscriberStatus};
use crate::{Result, StateError};
use berth_core::{
    pod_demand, pod_node_name, pod_node_selector, Cluster, CoreError, Ingress, Node, Pod,
    Resource, Volume,
};
use berth_storage::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for the cluster state
#[derive(Debug, Clone)]
pub struct ClusterStateConfig {
    /// Bound of every coordinator queue
    pub channel_capacity: usize,
    /// How long pod leases and releases wait for the coordinator
    pub lease_timeout: Option<Duration>,
    pub subscriber: SubscriberConfig,
}

impl Default for ClusterStateConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            lease_timeout: Some(Duration::from_secs(30)),
            subscriber: SubscriberConfig::default(),
        }
    }
}

/// Resource kinds the cluster state follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    Node,
    Volume,
    Ingress,
}

/// Handle to the cluster's topology and lease coordinator.
///
/// Cheap to clone. Every mutation is serialized through one coordinator
/// task; reads are snapshots of its current view.
#[derive(Clone)]
pub struct ClusterState {
    coordinator: CoordinatorHandle,
    registry: Registry,
    ipam: Arc<dyn Ipam>,
    cluster: Arc<Cluster>,
    lease_timeout: Option<Duration>,
    node_status: watch::Receiver<SubscriberStatus>,
    volume_status: watch::Receiver<SubscriberStatus>,
    ingress_status: watch::Receiver<SubscriberStatus>,
}

impl ClusterState {
    /// Load the cluster record, then spawn the coordinator and one subscriber
    /// per followed kind. The returned tasks stop when `token` is cancelled.
    pub fn start(
        registry: Registry,
        ipam: Arc<dyn Ipam>,
        config: ClusterStateConfig,
        token: CancellationToken,
    ) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let (clusters, _) = registry.list::<Cluster>()?;
        let cluster = clusters
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::resource_not_found(Cluster::gvk().storage_prefix()))?;

        info!(
            "Starting cluster state for {} (pod CIDR {})",
            cluster.display_name(),
            cluster.spec.pod_cidr
        );

        let (coordinator, handle) =
            Coordinator::new(registry.clone(), default_filters(), config.channel_capacity);

        let (nodes, node_status) = ChangeSubscriber::<Node>::new(
            registry.clone(),
            handle.nodes.clone(),
            config.subscriber.clone(),
        );
        let (volumes, volume_status) = ChangeSubscriber::<Volume>::new(
            registry.clone(),
            handle.volumes.clone(),
            config.subscriber.clone(),
        );
        let (ingresses, ingress_status) = ChangeSubscriber::<Ingress>::new(
            registry.clone(),
            handle.ingresses.clone(),
            config.subscriber.clone(),
        );

        let tasks = vec![
            tokio::spawn(coordinator.run(token.clone())),
            tokio::spawn(nodes.run(token.clone())),
            tokio::spawn(volumes.run(token.clone())),
            tokio::spawn(ingresses.run(token)),
        ];

        let state = Self {
            coordinator: handle,
            registry,
            ipam,
            cluster: Arc::new(cluster),
            lease_timeout: config.lease_timeout,
            node_status,
            volume_status,
            ingress_status,
        };

        Ok((state, tasks))
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn ipam(&self) -> &Arc<dyn Ipam> {
        &self.ipam
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn subscriber_status(&self, kind: TopologyKind) -> SubscriberStatus {
        match kind {
            TopologyKind::Node => self.node_status.borrow().clone(),
            TopologyKind::Volume => self.volume_status.borrow().clone(),
            TopologyKind::Ingress => self.ingress_status.borrow().clone(),
        }
    }

    /// Status channel of one subscriber, for callers that want to wait on it
    pub fn watch_subscriber(&self, kind: TopologyKind) -> watch::Receiver<SubscriberStatus> {
        match kind {
            TopologyKind::Node => self.node_status.clone(),
            TopologyKind::Volume => self.volume_status.clone(),
            TopologyKind::Ingress => self.ingress_status.clone(),
        }
    }

    // Leases

    /// Lease resources, waiting at most the configured lease timeout
    pub async fn lease(&self, options: LeaseOptions) -> Result<Node> {
        self.submit(LeaseKind::Lease, options, self.lease_timeout).await
    }

    pub async fn release(&self, options: LeaseOptions) -> Result<Node> {
        self.submit(LeaseKind::Release, options, self.lease_timeout).await
    }

    /// Lease resources, waiting for as long as the coordinator takes
    pub async fn lease_sync(&self, options: LeaseOptions) -> Result<Node> {
        self.submit(LeaseKind::Lease, options, None).await
    }

    pub async fn release_sync(&self, options: LeaseOptions) -> Result<Node> {
        self.submit(LeaseKind::Release, options, None).await
    }

    /// Lease what the pod's containers request on a node matching its selector
    pub async fn pod_lease(&self, pod: &Pod) -> Result<Node> {
        let options = pod_options(pod)?;
        self.lease(options).await
    }

    /// Give back what `pod` holds on the node it is bound to
    pub async fn pod_release(&self, pod: &Pod) -> Result<Node> {
        let node = pod_node_name(pod)
            .ok_or_else(|| StateError::not_bound(Pod::KIND, pod.display_name()))?
            .to_string();
        let options = pod_options(pod)?.on_node(node);
        self.release(options).await
    }

    pub async fn volume_lease(&self, volume: &Volume) -> Result<Node> {
        let mut options = LeaseOptions::new().storage(volume.storage_bytes()?);
        options.node = volume.spec.selector.node.clone();
        options.selector = volume.spec.selector.labels.clone();
        self.lease_sync(options).await
    }

    pub async fn volume_release(&self, volume: &Volume) -> Result<Node> {
        let node = volume
            .status
            .node
            .clone()
            .ok_or_else(|| StateError::not_bound(Volume::KIND, volume.display_name()))?;
        let options = LeaseOptions::new()
            .on_node(node)
            .storage(volume.storage_bytes()?);
        self.release_sync(options).await
    }

    // Topology updates

    pub async fn set_node(&self, node: Node) -> Result<()> {
        send(&self.coordinator.nodes, Observed::Upsert(node)).await
    }

    pub async fn del_node(&self, name: &str) -> Result<()> {
        send(
            &self.coordinator.nodes,
            Observed::Remove {
                key: name.to_string(),
                revision: None,
            },
        )
        .await
    }

    pub async fn set_volume(&self, volume: Volume) -> Result<()> {
        send(&self.coordinator.volumes, Observed::Upsert(volume)).await
    }

    pub async fn del_volume(&self, namespace: &str, name: &str) -> Result<()> {
        send(
            &self.coordinator.volumes,
            Observed::Remove {
                key: format!("{}/{}", namespace, name),
                revision: None,
            },
        )
        .await
    }

    pub async fn set_ingress(&self, ingress: Ingress) -> Result<()> {
        send(&self.coordinator.ingresses, Observed::Upsert(ingress)).await
    }

    pub async fn del_ingress(&self, name: &str) -> Result<()> {
        send(
            &self.coordinator.ingresses,
            Observed::Remove {
                key: name.to_string(),
                revision: None,
            },
        )
        .await
    }

    // Snapshots

    pub async fn node(&self, name: &str) -> Result<Option<Node>> {
        self.query(|reply| Query::Node {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        self.query(Query::Nodes).await
    }

    pub async fn volumes(&self) -> Result<Vec<Volume>> {
        self.query(Query::Volumes).await
    }

    pub async fn ingresses(&self) -> Result<Vec<Ingress>> {
        self.query(Query::Ingresses).await
    }

    pub async fn summary(&self) -> Result<ClusterSummary> {
        self.query(Query::Summary).await
    }

    async fn submit(
        &self,
        kind: LeaseKind,
        options: LeaseOptions,
        timeout: Option<Duration>,
    ) -> Result<Node> {
        let (request, rx) = LeaseRequest::new(kind, options);
        let queue = match kind {
            LeaseKind::Lease => &self.coordinator.leases,
            LeaseKind::Release => &self.coordinator.releases,
        };

        let exchange = async {
            queue
                .send(request)
                .await
                .map_err(|_| StateError::CoordinatorStopped)?;
            rx.await.map_err(|_| StateError::CoordinatorStopped)?
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange).await.map_err(|_| {
                debug!("{:?} request gave up after {:?}", kind, timeout);
                StateError::LeaseTimeout { timeout }
            })?,
            None => exchange.await,
        }
    }

    async fn query<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Query) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.coordinator
            .queries
            .send(build(reply))
            .await
            .map_err(|_| StateError::CoordinatorStopped)?;
        rx.await.map_err(|_| StateError::CoordinatorStopped)
    }
}

fn pod_options(pod: &Pod) -> Result<LeaseOptions> {
    let demand = pod_demand(pod)?;
    let mut options = LeaseOptions::new()
        .cpu(demand.cpu_millicores)
        .memory(demand.memory_bytes);
    options.selector = pod_node_selector(pod);
    Ok(options)
}

async fn send<T>(queue: &mpsc::Sender<Observed<T>>, update: Observed<T>) -> Result<()> {
    queue
        .send(update)
        .await
        .map_err(|_| StateError::CoordinatorStopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::CidrIpam;
    use berth_core::{NodeResources, Selector};
    use berth_storage::{RedbBackend, RevisionedStore, StoreConfig};
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        state: ClusterState,
        registry: Registry,
        token: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
        _dir: TempDir,
    }

    impl Harness {
        async fn shutdown(self) {
            self.token.cancel();
            for task in self.tasks {
                task.await.unwrap();
            }
        }
    }

    fn create_test_state(config: ClusterStateConfig) -> Harness {
        let dir = tempdir().unwrap();
        let kv = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        let store = Arc::new(RevisionedStore::new(kv, StoreConfig::default()).unwrap());
        let registry = Registry::new(store.clone());
        registry.put(Cluster::new("test", "10.88.0.0/16")).unwrap();

        let ipam = Arc::new(CidrIpam::new(store, "10.88.0.0/16").unwrap());
        let token = CancellationToken::new();
        let (state, tasks) =
            ClusterState::start(registry.clone(), ipam, config, token.clone()).unwrap();

        Harness {
            state,
            registry,
            token,
            tasks,
            _dir: dir,
        }
    }

    fn create_test_node(name: &str, memory: i64) -> Node {
        Node::new(name, NodeResources::new(4000, memory, 0))
    }

    fn create_test_pod(name: &str, memory: &str) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert("memory".to_string(), Quantity(memory.to_string()));

        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod
    }

    /// Wait until the coordinator's view satisfies `check`
    async fn wait_for_nodes(state: &ClusterState, check: impl Fn(&[Node]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if check(&state.nodes().await.unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_cluster_record() {
        let dir = tempdir().unwrap();
        let kv = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        let store = Arc::new(RevisionedStore::new(kv, StoreConfig::default()).unwrap());
        let ipam = Arc::new(CidrIpam::new(store.clone(), "10.88.0.0/16").unwrap());

        let result = ClusterState::start(
            Registry::new(store),
            ipam,
            ClusterStateConfig::default(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(StateError::Core(_))));
    }

    #[tokio::test]
    async fn test_first_fit_scenario() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = &harness.state;
        assert_eq!(state.cluster().spec.pod_cidr, "10.88.0.0/16");

        harness.registry.put(create_test_node("node-b", 512)).unwrap();
        harness.registry.put(create_test_node("node-a", 1024)).unwrap();
        wait_for_nodes(state, |nodes| nodes.len() == 2).await;

        let first = state.lease(LeaseOptions::new().memory(600)).await.unwrap();
        assert_eq!(first.name(), "node-a");
        assert_eq!(first.status.allocated.memory_bytes, 600);

        let second = state.lease(LeaseOptions::new().memory(500)).await.unwrap();
        assert_eq!(second.name(), "node-b");

        let err = state.lease(LeaseOptions::new().memory(500)).await.unwrap_err();
        assert!(matches!(err, StateError::NoResourceAvailable { .. }));

        // The coordinator's writes reached storage
        let stored: Node = harness
            .registry
            .get(&first.resource_key().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(stored.status.allocated.memory_bytes, 600);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_ledger() {
        let harness = create_test_state(ClusterStateConfig::default());

        let err = harness
            .state
            .lease(LeaseOptions::new().memory(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NoMatchingNode { .. }));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_leases_never_double_book() {
        let harness = create_test_state(ClusterStateConfig::default());
        harness.state.set_node(create_test_node("node-a", 1000)).await.unwrap();

        let (a, b) = tokio::join!(
            harness.state.lease(LeaseOptions::new().memory(600)),
            harness.state.lease(LeaseOptions::new().memory(600)),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        // With a second node both fit
        harness.state.set_node(create_test_node("node-b", 1000)).await.unwrap();
        let (c, d) = tokio::join!(
            harness.state.lease(LeaseOptions::new().memory(300)),
            harness.state.lease(LeaseOptions::new().memory(600)),
        );
        assert!(c.is_ok() && d.is_ok());

        for node in harness.state.nodes().await.unwrap() {
            assert!(node.status.allocated.fits_within(&node.status.capacity));
        }

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_pod_lease_and_release_round_trip() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = &harness.state;
        state.set_node(create_test_node("node-a", 1 << 30)).await.unwrap();

        let mut pod = create_test_pod("web", "256Mi");
        let err = state.pod_release(&pod).await.unwrap_err();
        assert!(matches!(err, StateError::NotBound { .. }));

        let node = state.pod_lease(&pod).await.unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 256 * 1024 * 1024);

        pod.spec.as_mut().unwrap().node_name = Some(node.name().to_string());
        let node = state.pod_release(&pod).await.unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_volume_lease_respects_selector() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = &harness.state;
        state
            .set_node(Node::new("node-a", NodeResources::new(0, 0, 1 << 40)))
            .await
            .unwrap();
        state
            .set_node(
                Node::new("node-b", NodeResources::new(0, 0, 1 << 40)).with_labels([("disk", "ssd")]),
            )
            .await
            .unwrap();

        let mut volume = Volume::new("default", "data", "10Gi");
        volume.spec.selector = Selector {
            node: None,
            labels: [("disk".to_string(), "ssd".to_string())].into(),
        };

        let node = state.volume_lease(&volume).await.unwrap();
        assert_eq!(node.name(), "node-b");
        assert_eq!(node.status.allocated.storage_bytes, 10 << 30);

        volume.status.node = Some(node.name().to_string());
        let node = state.volume_release(&volume).await.unwrap();
        assert_eq!(node.status.allocated.storage_bytes, 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_node_rejects_pinned_lease() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = &harness.state;

        let node = harness.registry.put(create_test_node("node-a", 1024)).unwrap();
        wait_for_nodes(state, |nodes| nodes.len() == 1).await;

        harness.registry.delete(&node.resource_key().unwrap()).unwrap();
        wait_for_nodes(state, |nodes| nodes.is_empty()).await;

        let err = state
            .lease(LeaseOptions::new().on_node("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NodeNotFound { .. }));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_topology_views() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = &harness.state;

        state.set_volume(Volume::new("default", "data", "1Gi")).await.unwrap();
        state.set_ingress(Ingress::new("web", "web.example.com")).await.unwrap();
        assert_eq!(state.volumes().await.unwrap().len(), 1);
        assert_eq!(state.ingresses().await.unwrap()[0].spec.host, "web.example.com");

        state.del_volume("default", "data").await.unwrap();
        state.del_ingress("web").await.unwrap();
        assert!(state.volumes().await.unwrap().is_empty());
        assert!(state.ingresses().await.unwrap().is_empty());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_coordinator() {
        let harness = create_test_state(ClusterStateConfig::default());
        let state = harness.state.clone();
        harness.shutdown().await;

        let err = state.nodes().await.unwrap_err();
        assert!(matches!(err, StateError::CoordinatorStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_timeout() {
        // A coordinator that never answers
        let dir = tempdir().unwrap();
        let kv = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        let store = Arc::new(RevisionedStore::new(kv, StoreConfig::default()).unwrap());
        let registry = Registry::new(store.clone());
        let (_coordinator, handle) = Coordinator::new(registry.clone(), default_filters(), 4);
        let (_, status) = watch::channel(SubscriberStatus::Starting);

        let state = ClusterState {
            coordinator: handle,
            registry,
            ipam: Arc::new(CidrIpam::new(store, "10.88.0.0/16").unwrap()),
            cluster: Arc::new(Cluster::new("test", "10.88.0.0/16")),
            lease_timeout: Some(Duration::from_secs(1)),
            node_status: status.clone(),
            volume_status: status.clone(),
            ingress_status: status,
        };

        let err = state.lease(LeaseOptions::new()).await.unwrap_err();
        assert!(matches!(err, StateError::LeaseTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_lease_leaves_capacity_free() {
        let dir = tempdir().unwrap();
        let kv = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        let store = Arc::new(RevisionedStore::new(kv, StoreConfig::default()).unwrap());
        let registry = Registry::new(store.clone());
        let (coordinator, handle) = Coordinator::new(registry.clone(), default_filters(), 4);
        let (_, status) = watch::channel(SubscriberStatus::Starting);

        let state = ClusterState {
            coordinator: handle,
            registry,
            ipam: Arc::new(CidrIpam::new(store, "10.88.0.0/16").unwrap()),
            cluster: Arc::new(Cluster::new("test", "10.88.0.0/16")),
            lease_timeout: Some(Duration::from_millis(50)),
            node_status: status.clone(),
            volume_status: status.clone(),
            ingress_status: status,
        };
        state.set_node(create_test_node("node-a", 1000)).await.unwrap();

        // Nobody serves the queue yet, so the caller gives up
        let err = state
            .lease(LeaseOptions::new().memory(600))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LeaseTimeout { .. }));

        let token = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(token.clone()));

        let node = state.node("node-a").await.unwrap().unwrap();
        assert_eq!(node.status.allocated.memory_bytes, 0);

        token.cancel();
        task.await.unwrap();
    }
}
